use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use rumen_core::commands::{ensure_initialized, Agent};

#[derive(Parser)]
#[command(
    name = "rumen-admin",
    about = "Operator tooling for a rumen root: feed observations, force ruminations, inspect state"
)]
struct Cli {
    /// Root directory holding config.toml, the log and the state DB
    #[arg(long, global = true, default_value = ".rumen")]
    root: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the root layout and default config (idempotent)
    Init,
    /// Record one turn from producer JSON (array, {"entities": [...]}, or JSON lines)
    Observe {
        /// Read from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Fold everything pending now, regardless of the window
    Ruminate,
    /// Print counters, pending count, traits and belief count
    Status,
    /// Dump observations with after < turn <= upto
    Log {
        #[arg(long, default_value_t = 0)]
        after: u64,
        #[arg(long)]
        upto: Option<u64>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Compact the observation log (bounded by the retention floor)
    Compact {
        #[arg(long)]
        keep_after: u64,
        #[arg(long, default_value_t = 5000)]
        max_records: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    match cli.cmd {
        Cmd::Init => init(&cli.root),
        Cmd::Observe { file, session } => observe(&cli.root, file, &session),
        Cmd::Ruminate => ruminate(&cli.root),
        Cmd::Status => status(&cli.root),
        Cmd::Log {
            after,
            upto,
            session,
        } => dump_log(&cli.root, after, upto, session.as_deref()),
        Cmd::Compact {
            keep_after,
            max_records,
        } => compact(&cli.root, keep_after, max_records),
    }
}

fn init(root: &Path) -> Result<()> {
    let report = ensure_initialized(root)?;
    print_json(&json!({
        "root": report.root.to_string_lossy(),
        "created": report.created,
        "existed": report.existed,
    }))
}

fn observe(root: &Path, file: Option<PathBuf>, session: &str) -> Result<()> {
    let text = match file {
        Some(path) => fs::read_to_string(&path).with_context(|| format!("reading {path:?}"))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };
    let payload = parse_payload(&text)?;
    let mut agent = Agent::open(root)?;
    let report = agent.step_payload(&payload, session)?;
    print_json(&json!({
        "turn": report.turn,
        "appended": report.appended,
        "pending": report.pending,
        "did_ruminate": report.did_ruminate,
        "did_reflect": report.did_reflect,
        "rumination": report.rumination,
        "traits": report.traits,
    }))
}

/// A single JSON document, or one JSON value per line.
fn parse_payload(text: &str) -> Result<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }
    let mut items = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v: Value = serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", i + 1))?;
        items.push(v);
    }
    Ok(Value::Array(items))
}

fn ruminate(root: &Path) -> Result<()> {
    let mut agent = Agent::open(root)?;
    let report = agent.ruminate_now()?;
    print_json(&report)
}

fn status(root: &Path) -> Result<()> {
    let agent = Agent::open(root)?;
    print_json(&json!({
        "root": agent.root().to_string_lossy(),
        "counters": agent.counters(),
        "pending": agent.pending()?,
        "log_records": agent.log().len()?,
        "beliefs": agent.beliefs().len(),
        "traits": agent.traits(),
        "now": agent.dynamic().now,
        "working_memory": agent.dynamic().working_memory,
    }))
}

fn dump_log(root: &Path, after: u64, upto: Option<u64>, session: Option<&str>) -> Result<()> {
    let agent = Agent::open(root)?;
    let upto = upto.unwrap_or(u64::MAX);
    for obs in agent.log().read_range(after, upto, session)? {
        println!("{}", serde_json::to_string(&obs)?);
    }
    Ok(())
}

fn compact(root: &Path, keep_after: u64, max_records: usize) -> Result<()> {
    let mut agent = Agent::open(root)?;
    let report = agent.compact_log(keep_after, max_records)?;
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
