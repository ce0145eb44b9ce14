// rumen-core/src/commands/init.rs

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::atomic::write_atomic;
use crate::utils::logbook::emit_event;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

// ---------- single global init gate ----------

static INIT: OnceCell<InitReport> = OnceCell::new();

/// Idempotent global initializer for the default root. Safe to call often.
pub fn ensure_initialized_once() -> Result<&'static InitReport> {
    INIT.get_or_try_init(|| ensure_initialized(&rumen_root()))
}

/// Resolve the default root. Override via RUMEN_ROOT (tests/venvs).
pub fn rumen_root() -> PathBuf {
    std::env::var_os("RUMEN_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".rumen"))
}

/// Lay out `root` (idempotent). Existing files are never overwritten.
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(root, "", &mut created, &mut existed)?;
    ensure_dir(root, "memory", &mut created, &mut existed)?;
    ensure_dir(root, "state", &mut created, &mut existed)?;
    ensure_dir(root, "config", &mut created, &mut existed)?;

    ensure_file(root, "config.toml", DEFAULT_CONFIG_TOML, &mut created, &mut existed)?;

    let logbook = root.join("logbook.jsonl");
    if logbook.exists() {
        existed.push("logbook.jsonl".to_string());
    } else {
        emit_event(
            &logbook,
            "system_init",
            json!({ "version": env!("CARGO_PKG_VERSION"), "root": root.to_string_lossy() }),
        )?;
        created.push("logbook.jsonl".to_string());
    }

    if !created.is_empty() {
        tracing::info!(root = %root.display(), created = ?created, "initialized rumen root");
    }
    Ok(InitReport {
        root: root.to_path_buf(),
        created,
        existed,
    })
}

fn ensure_dir(base: &Path, rel: &str, created: &mut Vec<String>, existed: &mut Vec<String>) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let label = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(label);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    write_atomic(&p, content_if_absent.as_bytes())?;
    created.push(rel_file.to_string());
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[system]
name = "rumen"
version = "0.1.0"

# Relative paths resolve against the root directory.
[memory]
wal_path = "memory/observations.jsonl"
state_db_path = "state/persona.db"
ontology_path = "config/ontology.json"

[logbook]
aggregate = "logbook.jsonl"
reflection_log = "memory/reflection_log.jsonl"

[services]
audit_enabled = true
reflection_enabled = true

[aggregator]
alpha = 0.25
conf_gain = 0.05
initial_confidence = 0.2
min_obs_conf = 0.75
min_abs_value = 0.1
min_delta = 0.01

[reflection]
drift_threshold = 0.25
conf_threshold = 0.70
min_obs = 10
beta = 0.05
max_step = 0.08
min_turns_between = 0
max_logged_triggers = 50

[[reflection.mappings]]
trait_name = "trust"
source_entity_type = "person"
source_dimension = "warmth"

[scheduler]
rumination_window = 20
retention_turns = 200
max_records_keep = 5000
"#;
