//! commands/agent.rs
//!
//! The per-turn driver. One `Agent` owns the observation log, the state
//! store and the in-memory belief/trait aggregates for a root directory.
//!
//! A turn appends the (sanitized, stamped) observations durably, then, once
//! `rumination_window` turns have passed, ruminates:
//! 1. read the pending range `(cursor, turn]`;
//! 2. fold it into a staging copy of the beliefs;
//! 3. advance the cursor;
//! 4. run the drift engine if due;
//! 5. commit beliefs, traits and counters in one transaction;
//! 6. swap the staging copies in, write the audit trail, compact the log.
//!
//! Nothing before step 5 is visible. A crash before it replays the whole
//! range against the previous beliefs on the next rumination.
//!
//! Every turn also moves the short-horizon [`DynamicState`] (mood and
//! working memory), saved with the counters.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::commands::init::{ensure_initialized, ensure_initialized_once};
use crate::config::CoreConfig;
use crate::services::audit::Audit;
use crate::services::beliefs::{Aggregator, BeliefMap, BeliefStore, FoldReport};
use crate::services::now::{DynamicState, NowState};
use crate::services::observation::{Extractor, Observation, Ontology, OpenVocabulary, Vocabulary};
use crate::services::reflection::{DriftEngine, TraitUpdate, TraitVector};
use crate::services::state::{Counters, StateStore};
use crate::services::wal::{CompactionReport, ObservationLog};

/// What one rumination did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuminationReport {
    pub turn: u64,
    pub forced: bool,
    /// Bounds of the folded range `(from_exclusive, to_inclusive]`.
    pub from_turn_exclusive: u64,
    pub to_turn_inclusive: u64,
    pub fold: FoldReport,
    pub did_reflect: bool,
    pub traits_updated: BTreeMap<String, TraitUpdate>,
    pub rebaselined: usize,
    pub beliefs_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionReport>,
}

/// Returned to the caller after every turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub turn: u64,
    pub appended: usize,
    /// Records still pending after this turn, i.e. strictly after the
    /// (possibly just advanced) cursor.
    pub pending: usize,
    pub did_ruminate: bool,
    pub did_reflect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rumination: Option<RuminationReport>,
    pub beliefs: BeliefMap,
    pub traits: BTreeMap<String, f64>,
    pub now: NowState,
}

pub struct Agent {
    root: PathBuf,
    cfg: CoreConfig,
    log: ObservationLog,
    state: StateStore,
    beliefs: BeliefStore,
    traits: TraitVector,
    counters: Counters,
    dynamic: DynamicState,
    aggregator: Aggregator,
    engine: DriftEngine,
    audit: Audit,
    vocab: Box<dyn Vocabulary>,
}

impl Agent {
    /// Open (initializing if needed) the agent rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        ensure_initialized(root)?;
        let cfg = CoreConfig::load(root)?;
        Self::with_config(root, cfg)
    }

    /// Open the agent at the default root (`RUMEN_ROOT` or `.rumen`).
    pub fn open_default() -> Result<Self> {
        let report = ensure_initialized_once()?;
        let cfg = CoreConfig::load(&report.root)?;
        Self::with_config(&report.root, cfg)
    }

    /// Open with an already loaded config; paths in `cfg` are used as given.
    pub fn with_config(root: &Path, cfg: CoreConfig) -> Result<Self> {
        cfg.validate()?;
        let log = ObservationLog::open(&cfg.memory.wal_path)?;
        let state = StateStore::open(&cfg.memory.state_db_path)?;
        let beliefs = state.load_beliefs()?;
        let mut traits = state.load_traits()?;
        let mut counters = state.load_counters()?;
        let dynamic = state.load_dynamic()?;

        for m in &cfg.reflection.mappings {
            traits.ensure(&m.trait_name);
        }

        let vocab: Box<dyn Vocabulary> = if cfg.memory.ontology_path.exists() {
            Box::new(Ontology::load(&cfg.memory.ontology_path)?)
        } else {
            Box::new(OpenVocabulary)
        };

        let audit = Audit::from_config(&cfg);
        let window = cfg.scheduler.rumination_window;
        if counters.rumination_window_size != window {
            if counters.rumination_window_size != 0 {
                tracing::info!(
                    persisted = counters.rumination_window_size,
                    configured = window,
                    "rumination window changed by config"
                );
            }
            counters.rumination_window_size = window;
        }

        let mut agent = Self {
            root: root.to_path_buf(),
            aggregator: Aggregator::new(cfg.aggregator.clone()),
            engine: DriftEngine::new(cfg.reflection.clone()),
            cfg,
            log,
            state,
            beliefs,
            traits,
            counters,
            dynamic,
            audit,
            vocab,
        };
        agent.recover()?;
        tracing::debug!(
            root = %agent.root.display(),
            turn = agent.counters.current_turn,
            cursor = agent.counters.cursor.last_committed_turn(),
            beliefs = agent.beliefs.len(),
            "agent opened"
        );
        Ok(agent)
    }

    // ---------- turn driver ----------

    /// Record one external turn.
    pub fn step(&mut self, observations: Vec<Observation>, session_id: &str) -> Result<TurnReport> {
        let turn = self.counters.current_turn + 1;
        let batch: Vec<Observation> = observations
            .into_iter()
            .filter_map(Observation::sanitized)
            .map(|o| o.stamped(turn, session_id))
            .collect();
        let appended = self.log.append(&batch)?;

        let mut next = self.counters;
        next.current_turn = turn;
        next.turns_since_last_rumination += 1;
        next.rumination_window_size = self.cfg.scheduler.rumination_window;
        let mut dynamic = self.dynamic.clone();
        dynamic.observe(&batch, turn);

        let due = next.turns_since_last_rumination >= next.rumination_window_size;
        let outcome = if due {
            self.ruminate(next, dynamic.clone(), false).map(Some)
        } else {
            self.state.save_turn(&next, &dynamic).map(|()| None)
        };
        let rumination = match outcome {
            Ok(Some(report)) => Some(report),
            Ok(None) => {
                self.counters = next;
                self.dynamic = dynamic;
                None
            }
            Err(e) => {
                // The batch is already in the log: number the next turn after
                // it, as a reopen would. Nothing is folded, so it stays pending.
                self.counters = next;
                self.dynamic = dynamic;
                tracing::warn!(turn, error = %e, "turn state not persisted; observations stay pending");
                return Err(e);
            }
        };

        let pending = self.pending()?;
        tracing::debug!(turn, appended, pending, ruminated = rumination.is_some(), "turn recorded");
        Ok(TurnReport {
            turn,
            appended,
            pending,
            did_ruminate: rumination.is_some(),
            did_reflect: rumination.as_ref().is_some_and(|r| r.did_reflect),
            rumination,
            beliefs: self.beliefs.snapshot().clone(),
            traits: self.traits.as_map().clone(),
            now: self.dynamic.now.clone(),
        })
    }

    /// Run the extractor over `text`, then [`step`](Self::step).
    pub fn step_text(&mut self, extractor: &dyn Extractor, text: &str, session_id: &str) -> Result<TurnReport> {
        let observations = extractor.extract(text).context("extracting observations")?;
        self.step(observations, session_id)
    }

    /// Decode producer JSON with the agent's vocabulary, then [`step`](Self::step).
    pub fn step_payload(&mut self, payload: &Value, session_id: &str) -> Result<TurnReport> {
        let observations = Observation::from_payload_batch(payload, self.vocab.as_ref());
        self.step(observations, session_id)
    }

    /// Ruminate at the current turn regardless of the window.
    pub fn ruminate_now(&mut self) -> Result<RuminationReport> {
        let next = self.counters;
        let dynamic = self.dynamic.clone();
        self.ruminate(next, dynamic, true)
    }

    /// Operator-driven compaction. `keep_turn_greater_than` is lowered to the
    /// retention floor and `max_records_keep` is raised to cover everything
    /// above it, so folded-but-retained and pending records survive.
    pub fn compact_log(&mut self, keep_turn_greater_than: u64, max_records_keep: usize) -> Result<CompactionReport> {
        let floor = self.retention_floor();
        let keep_after = keep_turn_greater_than.min(floor);
        if keep_after < keep_turn_greater_than {
            tracing::info!(requested = keep_turn_greater_than, floor, "compaction bound lowered to retention floor");
        }
        let protected = self.log.count_range(floor, u64::MAX, None)?;
        let cap = max_records_keep.max(protected).max(1);
        if cap > max_records_keep {
            tracing::info!(requested = max_records_keep, cap, "compaction cap raised to keep records above the retention floor");
        }
        let report = self.log.compact(keep_after, cap)?;
        self.audit.record_action(
            "compaction",
            json!({ "keep_turn_greater_than": keep_after, "max_records_keep": cap, "report": report }),
        );
        Ok(report)
    }

    // ---------- accessors ----------

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn beliefs(&self) -> &BeliefStore {
        &self.beliefs
    }

    pub fn traits(&self) -> &TraitVector {
        &self.traits
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn log(&self) -> &ObservationLog {
        &self.log
    }

    pub fn dynamic(&self) -> &DynamicState {
        &self.dynamic
    }

    /// Records in `(cursor, current_turn]`.
    pub fn pending(&self) -> Result<usize> {
        match self.counters.cursor.pending_range(self.counters.current_turn) {
            Some((lo, hi)) => self.log.count_range(lo, hi, None),
            None => Ok(0),
        }
    }

    // ---------- internals ----------

    fn ruminate(&mut self, mut next: Counters, dynamic: DynamicState, forced: bool) -> Result<RuminationReport> {
        let turn = next.current_turn;
        let from = next.cursor.last_committed_turn();
        let batch = match next.cursor.pending_range(turn) {
            Some((lo, hi)) => self.log.read_range(lo, hi, None)?,
            None => Vec::new(),
        };

        let mut beliefs = self.beliefs.clone();
        let mut traits = self.traits.clone();
        let fold = self.aggregator.fold(&mut beliefs, &batch, turn);

        next.cursor.advance(turn)?;
        next.turns_since_last_rumination = 0;
        next.last_rumination_turn = turn;

        let reflection = if self.reflection_due(&next) {
            next.last_reflection_turn = turn;
            Some(self.engine.run(&mut beliefs, &mut traits, turn))
        } else {
            None
        };

        // sole commit point
        let stats = self
            .state
            .commit(&mut beliefs, &traits, &next, &dynamic)
            .with_context(|| format!("committing rumination at turn {turn}"))?;
        self.beliefs = beliefs;
        self.traits = traits;
        self.counters = next;
        self.dynamic = dynamic;

        let mut report = RuminationReport {
            turn,
            forced,
            from_turn_exclusive: from,
            to_turn_inclusive: turn,
            fold,
            did_reflect: reflection.is_some(),
            traits_updated: BTreeMap::new(),
            rebaselined: 0,
            beliefs_written: stats.beliefs_written,
            compaction: None,
        };
        if let Some(run) = &reflection {
            report.traits_updated = run
                .trait_updates()
                .map(|(name, u)| (name.to_string(), u.clone()))
                .collect();
            report.rebaselined = run.rebaselined;
            self.audit.record_reflection(&run.entries);
        }

        // Records at or below the floor are folded; losing them only costs history.
        let floor = self.retention_floor();
        match self.log.compact(floor, self.cfg.scheduler.max_records_keep) {
            Ok(c) => report.compaction = Some(c),
            Err(e) => tracing::warn!(turn, error = %e, "log compaction failed; will retry next rumination"),
        }

        self.audit.record_action(
            "rumination",
            json!({
                "turn": turn,
                "forced": forced,
                "from_turn_exclusive": from,
                "fold": report.fold,
                "did_reflect": report.did_reflect,
                "traits_updated": report.traits_updated,
                "compaction": report.compaction,
            }),
        );
        tracing::info!(
            turn,
            folded = report.fold.observations,
            admitted = report.fold.admitted,
            reflected = report.did_reflect,
            "rumination committed"
        );
        Ok(report)
    }

    fn reflection_due(&self, next: &Counters) -> bool {
        if !self.cfg.services.reflection_enabled || self.engine.mappings().is_empty() {
            return false;
        }
        next.last_reflection_turn == 0
            || next.current_turn.saturating_sub(next.last_reflection_turn) >= self.cfg.reflection.min_turns_between
    }

    fn retention_floor(&self) -> u64 {
        self.counters.cursor.retention_floor(self.cfg.scheduler.retention_turns)
    }

    /// Catch the turn counter up with a log that got ahead of it
    /// (crash after append, before the counters were saved). The missed
    /// turns are replayed into the dynamic state.
    fn recover(&mut self) -> Result<()> {
        let Some(log_turn) = self.log.max_turn() else {
            return Ok(());
        };
        if log_turn <= self.counters.current_turn {
            return Ok(());
        }
        let from = self.counters.current_turn;
        let mut next = self.counters;
        next.current_turn = log_turn;
        next.turns_since_last_rumination += log_turn - from;

        let missed = self.log.read_range(from, log_turn, None)?;
        let mut dynamic = self.dynamic.clone();
        for turn_batch in missed.chunk_by(|a, b| a.turn == b.turn) {
            dynamic.observe(turn_batch, turn_batch[0].turn);
        }
        self.state.save_turn(&next, &dynamic)?;
        self.counters = next;
        self.dynamic = dynamic;

        tracing::warn!(from, to = log_turn, "turn counter behind observation log; recovered");
        self.audit.record_action(
            "state_recovered",
            json!({
                "from_turn": from,
                "to_turn": log_turn,
                "last_committed_turn": next.cursor.last_committed_turn(),
            }),
        );
        Ok(())
    }
}
