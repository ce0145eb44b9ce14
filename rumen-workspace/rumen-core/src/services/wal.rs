//! services/wal.rs
//!
//! Append-only observation log (JSON Lines).
//!
//! Line shape: `{"seq":7,"ts":"<rfc3339>","obs":{...},"sum":"<blake3-16>"}`
//! - every line is independently parseable; a torn or corrupted line is
//!   skipped on read and dropped on compaction, never fatal;
//! - `sum` covers the serialized observation so bit rot is caught too;
//! - `append` fsyncs before returning;
//! - `compact` rewrites through a temp file + rename, so readers see the old
//!   log or the new log, never a half-written one.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::RumenError;
use crate::services::observation::Observation;
use crate::utils::atomic::{append_lines, write_atomic};

const SUM_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalLine {
    seq: u64,
    ts: String,
    obs: Observation,
    sum: String,
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub seq: u64,
    pub ts: String,
    pub observation: Observation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CompactionReport {
    pub before: usize,
    pub kept: usize,
    pub dropped_by_turn: usize,
    pub dropped_by_cap: usize,
    pub malformed_dropped: usize,
}

impl CompactionReport {
    pub fn rewrote(&self) -> bool {
        self.kept != self.before || self.malformed_dropped > 0
    }
}

/// Records plus the number of lines that failed to decode.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub records: Vec<LogRecord>,
    pub malformed: usize,
}

pub struct ObservationLog {
    path: PathBuf,
    next_seq: u64,
    last_turn: Option<u64>,
}

impl ObservationLog {
    /// Open (or lazily create) the log at `path`. Scans once to recover the
    /// sequence counter and the last turn written.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all({:?})", parent))?;
        }
        let mut log = Self {
            path,
            next_seq: 1,
            last_turn: None,
        };
        let mut max_seq = 0u64;
        let mut last_turn = None;
        let malformed = log.for_each_record(|rec, _| {
            max_seq = max_seq.max(rec.seq);
            last_turn = Some(last_turn.map_or(rec.obs.turn, |t: u64| t.max(rec.obs.turn)));
        })?;
        if malformed > 0 {
            tracing::warn!(path = %log.path.display(), malformed, "observation log contains malformed lines");
        }
        log.next_seq = max_seq + 1;
        log.last_turn = last_turn;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest turn present in the log (as of open + appends).
    pub fn max_turn(&self) -> Option<u64> {
        self.last_turn
    }

    /// Durably append `records` in order. Returns how many were written.
    ///
    /// Turns must be non-decreasing, both within the batch and relative to
    /// what is already in the log; a regression rejects the whole batch.
    /// So does a NaN or infinite value or confidence, which JSON cannot carry.
    pub fn append(&mut self, records: &[Observation]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut last = self.last_turn;
        for r in records {
            if !r.confidence.is_finite() || r.dimension_values.values().any(|v| !v.is_finite()) {
                return Err(RumenError::NonFiniteValue {
                    turn: r.turn,
                    entity_type: r.entity_type.clone(),
                    entity: r.entity.clone(),
                }
                .into());
            }
            if let Some(prev) = last {
                if r.turn < prev {
                    return Err(RumenError::TurnRegression {
                        last: prev,
                        requested: r.turn,
                    }
                    .into());
                }
            }
            last = Some(r.turn);
        }

        let ts = Utc::now().to_rfc3339();
        let mut lines = Vec::with_capacity(records.len());
        let mut seq = self.next_seq;
        for obs in records {
            let line = WalLine {
                seq,
                ts: ts.clone(),
                obs: obs.clone(),
                sum: checksum(obs)?,
            };
            lines.push(serde_json::to_vec(&line)?);
            seq += 1;
        }
        append_lines(&self.path, &lines)
            .with_context(|| format!("appending {} records to {}", records.len(), self.path.display()))?;

        self.next_seq = seq;
        self.last_turn = last;
        Ok(records.len())
    }

    /// Observations with `min_turn_exclusive < turn <= max_turn_inclusive`,
    /// optionally limited to one session, in append order.
    pub fn read_range(
        &self,
        min_turn_exclusive: u64,
        max_turn_inclusive: u64,
        session: Option<&str>,
    ) -> Result<Vec<Observation>> {
        let mut out = Vec::new();
        self.for_each_record(|rec, _| {
            if in_range(&rec.obs, min_turn_exclusive, max_turn_inclusive, session) {
                out.push(rec.obs);
            }
        })?;
        Ok(out)
    }

    pub fn count_range(
        &self,
        min_turn_exclusive: u64,
        max_turn_inclusive: u64,
        session: Option<&str>,
    ) -> Result<usize> {
        let mut n = 0usize;
        self.for_each_record(|rec, _| {
            if in_range(&rec.obs, min_turn_exclusive, max_turn_inclusive, session) {
                n += 1;
            }
        })?;
        Ok(n)
    }

    /// Every decodable record plus the malformed-line count.
    pub fn scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        report.malformed = self.for_each_record(|rec, _| {
            report.records.push(LogRecord {
                seq: rec.seq,
                ts: rec.ts,
                observation: rec.obs,
            });
        })?;
        Ok(report)
    }

    pub fn len(&self) -> Result<usize> {
        let mut n = 0usize;
        self.for_each_record(|_, _| n += 1)?;
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keep records with `turn > keep_turn_greater_than`; of those, keep at
    /// most the newest `max_records_keep`. Malformed lines are dropped.
    pub fn compact(
        &mut self,
        keep_turn_greater_than: u64,
        max_records_keep: usize,
    ) -> Result<CompactionReport> {
        let mut report = CompactionReport::default();
        let mut survivors: Vec<Vec<u8>> = Vec::new();
        report.malformed_dropped = self.for_each_record(|rec, raw| {
            report.before += 1;
            if rec.obs.turn > keep_turn_greater_than {
                survivors.push(raw.to_vec());
            } else {
                report.dropped_by_turn += 1;
            }
        })?;

        if survivors.len() > max_records_keep {
            let excess = survivors.len() - max_records_keep;
            survivors.drain(..excess);
            report.dropped_by_cap = excess;
        }
        report.kept = survivors.len();

        if !report.rewrote() {
            return Ok(report);
        }

        let mut bytes = Vec::new();
        for line in &survivors {
            bytes.extend_from_slice(line);
            bytes.push(b'\n');
        }
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("rewriting {}", self.path.display()))?;

        tracing::debug!(
            path = %self.path.display(),
            before = report.before,
            kept = report.kept,
            "observation log compacted"
        );
        Ok(report)
    }

    // ---- Internal helpers --------------------------------------------------

    /// Visit every valid record with its raw line bytes; returns the number
    /// of malformed lines skipped. A missing file reads as empty.
    fn for_each_record(&self, mut visit: impl FnMut(WalLine, &[u8])) -> Result<usize> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("open {}", self.path.display()));
            }
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0usize;
        let mut malformed = 0usize;
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("read {}", self.path.display()))?;
            if n == 0 {
                break;
            }
            line_no += 1;
            let line = trim_line(&buf);
            if line.is_empty() {
                continue;
            }
            match decode_line(line) {
                Some(rec) => visit(rec, line),
                None => {
                    malformed += 1;
                    tracing::warn!(path = %self.path.display(), line = line_no, "skipping malformed log record");
                }
            }
        }
        Ok(malformed)
    }
}

fn in_range(obs: &Observation, min_excl: u64, max_incl: u64, session: Option<&str>) -> bool {
    obs.turn > min_excl
        && obs.turn <= max_incl
        && session.map_or(true, |s| obs.session_id == s)
}

fn decode_line(line: &[u8]) -> Option<WalLine> {
    let rec: WalLine = serde_json::from_slice(line).ok()?;
    let expected = checksum(&rec.obs).ok()?;
    (rec.sum == expected).then_some(rec)
}

fn checksum(obs: &Observation) -> Result<String> {
    let bytes = serde_json::to_vec(obs)?;
    let hex = blake3::hash(&bytes).to_hex().to_string();
    Ok(hex[..SUM_HEX_LEN].to_string())
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &buf[..end]
}
