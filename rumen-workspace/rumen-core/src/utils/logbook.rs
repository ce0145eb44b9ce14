// src/utils/logbook.rs
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use crate::utils::atomic::append_lines;

#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    event: &'a str,
    data: &'a Value,
}

/// Append one serializable value as a JSON line.
pub fn append_jsonl<S: Serialize>(path: &Path, val: &S) -> Result<()> {
    let line = serde_json::to_vec(val)?;
    append_lines(path, &[line])
}

/// Append many values in one write + fsync.
pub fn append_jsonl_batch<S: Serialize>(path: &Path, vals: &[S]) -> Result<()> {
    if vals.is_empty() {
        return Ok(());
    }
    let lines = vals
        .iter()
        .map(serde_json::to_vec)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    append_lines(path, &lines)
}

pub fn emit_event(path: &Path, event: &str, data: Value) -> Result<()> {
    let line = EventLine {
        ts: Utc::now().to_rfc3339(),
        event,
        data: &data,
    };
    append_jsonl(path, &line)
}
