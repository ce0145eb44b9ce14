//! Rumen-Core: a persistent observation log, an incremental belief
//! aggregator and a drift-gated trait updater for long-lived agents.

pub mod commands;
pub mod config;
pub mod error;
pub mod services;
pub mod utils;

pub use commands::{Agent, RuminationReport, TurnReport};
pub use error::RumenError;
