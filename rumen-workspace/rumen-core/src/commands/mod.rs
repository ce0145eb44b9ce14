// src/commands/mod.rs
pub mod agent;
pub mod init;

pub use agent::{Agent, RuminationReport, TurnReport};
pub use init::{InitReport, ensure_initialized, ensure_initialized_once};
