//! services/audit.rs
//! Append-only audit trail: reflection decisions and agent actions.
//!
//! - `reflection_log.jsonl` gets one [`ReflectionLogEntry`] per mapping per run.
//! - `logbook.jsonl` gets `{ts, event, data}` action lines.
//! - Writes are best-effort: a failure is reported through `tracing` and never
//!   fails the caller, because the state they describe is already committed.

use serde_json::Value;
use std::path::PathBuf;

use crate::config::CoreConfig;
use crate::services::reflection::ReflectionLogEntry;
use crate::utils::logbook::{append_jsonl_batch, emit_event};

#[derive(Debug, Clone)]
pub struct Audit {
    reflection_log: PathBuf,
    logbook: PathBuf,
    enabled: bool,
}

impl Audit {
    pub fn new(reflection_log: impl Into<PathBuf>, logbook: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            reflection_log: reflection_log.into(),
            logbook: logbook.into(),
            enabled,
        }
    }

    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self::new(
            cfg.logbook.reflection_log.clone(),
            cfg.logbook.aggregate.clone(),
            cfg.services.audit_enabled,
        )
    }

    /// Append one reflection run. Entries land in a single write.
    pub fn record_reflection(&self, entries: &[ReflectionLogEntry]) {
        if !self.enabled || entries.is_empty() {
            return;
        }
        if let Err(e) = append_jsonl_batch(&self.reflection_log, entries) {
            tracing::warn!(
                path = %self.reflection_log.display(),
                error = %e,
                entries = entries.len(),
                "failed to write reflection log"
            );
        }
    }

    /// Record a generic agent action (`rumination`, `compaction`, `state_recovered`, ...).
    pub fn record_action(&self, action: &str, details: Value) {
        if !self.enabled {
            return;
        }
        if let Err(e) = emit_event(&self.logbook, action, details) {
            tracing::warn!(
                path = %self.logbook.display(),
                action,
                error = %e,
                "failed to write logbook event"
            );
        }
    }
}
