//! Typed errors for invariant violations callers may want to match on.
//! Everything else travels as `anyhow::Error` with context attached.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RumenError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("commit cursor cannot move backwards (at {current}, asked for {requested})")]
    CursorRegression { current: u64, requested: u64 },

    #[error("observation log turns must be non-decreasing (last {last}, got {requested})")]
    TurnRegression { last: u64, requested: u64 },

    #[error("observation {entity_type}:{entity} at turn {turn} carries a non-finite number")]
    NonFiniteValue { turn: u64, entity_type: String, entity: String },
}
