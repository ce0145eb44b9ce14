// src/services/state.rs
//! Durable persona state: run counters, beliefs and traits.
//!
//! - Owns a single SQLite connection (WAL); this is the only writer.
//! - `commit` writes touched beliefs, traits, counters and the per-turn
//!   dynamic state in one transaction. The counters row carrying
//!   `last_buffer_committed_turn` is the cursor, so a fold and its cursor
//!   advance land together or not at all.

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::services::beliefs::{BeliefDimension, BeliefKey, BeliefStore};
use crate::services::cursor::CommitCursor;
use crate::services::now::DynamicState;
use crate::services::reflection::TraitVector;

/// Scheduler bookkeeping persisted as key/value rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub current_turn: u64,
    pub turns_since_last_rumination: u64,
    pub rumination_window_size: u64,
    #[serde(rename = "last_buffer_committed_turn")]
    pub cursor: CommitCursor,
    pub last_rumination_turn: u64,
    pub last_reflection_turn: u64,
}

impl Counters {
    fn entries(&self) -> [(&'static str, u64); 6] {
        [
            ("current_turn", self.current_turn),
            ("turns_since_last_rumination", self.turns_since_last_rumination),
            ("rumination_window_size", self.rumination_window_size),
            ("last_buffer_committed_turn", self.cursor.last_committed_turn()),
            ("last_rumination_turn", self.last_rumination_turn),
            ("last_reflection_turn", self.last_reflection_turn),
        ]
    }

    fn set(&mut self, key: &str, value: u64) {
        match key {
            "current_turn" => self.current_turn = value,
            "turns_since_last_rumination" => self.turns_since_last_rumination = value,
            "rumination_window_size" => self.rumination_window_size = value,
            "last_buffer_committed_turn" => self.cursor = CommitCursor::new(value),
            "last_rumination_turn" => self.last_rumination_turn = value,
            "last_reflection_turn" => self.last_reflection_turn = value,
            other => tracing::debug!(key = other, "ignoring unknown counter"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub beliefs_written: usize,
    pub traits_written: usize,
}

pub struct StateStore {
    pub(crate) db: Connection,
}

impl StateStore {
    /// Open/create the SQLite DB and ensure schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all({:?})", parent))?;
        }
        let db = Connection::open(db_path)
            .with_context(|| format!("open sqlite at {:?}", db_path))?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS counters (
              key    TEXT PRIMARY KEY,
              value  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS beliefs (
              entity_type        TEXT NOT NULL,
              entity             TEXT NOT NULL,
              dimension          TEXT NOT NULL,
              mean               REAL NOT NULL,     -- [-1, 1]
              confidence         REAL NOT NULL,     -- [0, 1]
              n                  INTEGER NOT NULL,  -- admitted observations
              last_updated_turn  INTEGER NOT NULL,
              baseline_mean      REAL NOT NULL,     -- drift reference
              baseline_turn      INTEGER NOT NULL,
              PRIMARY KEY (entity_type, entity, dimension)
            );

            CREATE TABLE IF NOT EXISTS traits (
              name          TEXT PRIMARY KEY,
              value         REAL NOT NULL,          -- [-1, 1]
              updated_turn  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dynamic (
              key    TEXT PRIMARY KEY,              -- 'now' | 'working_memory'
              value  TEXT NOT NULL                  -- JSON
            );
            "#,
        )?;
        Ok(Self { db })
    }

    pub fn load_counters(&self) -> Result<Counters> {
        let mut counters = Counters::default();
        let mut stmt = self.db.prepare("SELECT key, value FROM counters")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (key, value) = row?;
            counters.set(&key, to_u64(value));
        }
        Ok(counters)
    }

    pub fn load_beliefs(&self) -> Result<BeliefStore> {
        let mut store = BeliefStore::new();
        let mut stmt = self.db.prepare(
            "SELECT entity_type, entity, dimension, mean, confidence, n,
                    last_updated_turn, baseline_mean, baseline_turn
             FROM beliefs",
        )?;
        let rows = stmt.query_map([], |row| {
            let key = BeliefKey {
                entity_type: row.get(0)?,
                entity: row.get(1)?,
                dimension: row.get(2)?,
            };
            let belief = BeliefDimension {
                mean: row.get(3)?,
                confidence: row.get(4)?,
                n: to_u64(row.get(5)?),
                last_updated_turn: to_u64(row.get(6)?),
                baseline_mean: row.get(7)?,
                baseline_turn: to_u64(row.get(8)?),
            };
            Ok((key, belief))
        })?;
        for row in rows {
            let (key, belief) = row?;
            store.restore(key, belief);
        }
        Ok(store)
    }

    pub fn load_traits(&self) -> Result<TraitVector> {
        let mut traits = TraitVector::new();
        let mut stmt = self.db.prepare("SELECT name, value FROM traits")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        for row in rows {
            let (name, value) = row?;
            traits.set(&name, value);
        }
        Ok(traits)
    }

    /// Missing rows load as the neutral default.
    pub fn load_dynamic(&self) -> Result<DynamicState> {
        let mut dynamic = DynamicState::default();
        let mut stmt = self.db.prepare("SELECT key, value FROM dynamic")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (key, value) = row?;
            match key.as_str() {
                "now" => {
                    dynamic.now = serde_json::from_str(&value).context("decode dynamic.now")?;
                }
                "working_memory" => {
                    dynamic.working_memory =
                        serde_json::from_str(&value).context("decode dynamic.working_memory")?;
                }
                other => tracing::debug!(key = other, "ignoring unknown dynamic row"),
            }
        }
        Ok(dynamic)
    }

    /// Persist counters alone.
    pub fn save_counters(&mut self, counters: &Counters) -> Result<()> {
        let tx = self.db.transaction()?;
        write_counters(&tx, counters)?;
        tx.commit().context("commit counters")?;
        Ok(())
    }

    /// Persist a turn without a rumination: counters plus dynamic state.
    pub fn save_turn(&mut self, counters: &Counters, dynamic: &DynamicState) -> Result<()> {
        let tx = self.db.transaction()?;
        write_counters(&tx, counters)?;
        write_dynamic(&tx, dynamic)?;
        tx.commit().context("commit turn")?;
        Ok(())
    }

    /// Write dirty beliefs, all traits, the counters and the dynamic state in
    /// one transaction. The dirty set is cleared only after the transaction
    /// commits.
    pub fn commit(
        &mut self,
        beliefs: &mut BeliefStore,
        traits: &TraitVector,
        counters: &Counters,
        dynamic: &DynamicState,
    ) -> Result<CommitStats> {
        let mut stats = CommitStats::default();
        let tx = self.db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO beliefs(entity_type, entity, dimension, mean, confidence, n,
                                    last_updated_turn, baseline_mean, baseline_turn)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(entity_type, entity, dimension) DO UPDATE SET
                  mean              = excluded.mean,
                  confidence        = excluded.confidence,
                  n                 = excluded.n,
                  last_updated_turn = excluded.last_updated_turn,
                  baseline_mean     = excluded.baseline_mean,
                  baseline_turn     = excluded.baseline_turn
                "#,
            )?;
            for key in beliefs.dirty() {
                let Some(b) = beliefs.get_key(key) else {
                    continue;
                };
                stmt.execute(params![
                    key.entity_type,
                    key.entity,
                    key.dimension,
                    b.mean,
                    b.confidence,
                    to_i64(b.n)?,
                    to_i64(b.last_updated_turn)?,
                    b.baseline_mean,
                    to_i64(b.baseline_turn)?,
                ])?;
                stats.beliefs_written += 1;
            }
        }
        {
            // updated_turn only moves when the value does
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO traits(name, value, updated_turn) VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                  updated_turn = CASE WHEN traits.value != excluded.value
                                      THEN excluded.updated_turn
                                      ELSE traits.updated_turn END,
                  value        = excluded.value
                "#,
            )?;
            let turn = to_i64(counters.current_turn)?;
            for (name, value) in traits.iter() {
                stmt.execute(params![name, value, turn])?;
                stats.traits_written += 1;
            }
        }
        write_counters(&tx, counters)?;
        write_dynamic(&tx, dynamic)?;
        tx.commit().context("commit rumination state")?;

        beliefs.take_dirty();
        Ok(stats)
    }

    /// Turn at which a trait last changed value.
    pub fn trait_updated_turn(&self, name: &str) -> Result<Option<u64>> {
        let mut stmt = self.db.prepare("SELECT updated_turn FROM traits WHERE name=?1")?;
        let mut rows = stmt.query([name])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(to_u64(row.get(0)?)));
        }
        Ok(None)
    }
}

fn write_counters(conn: &Connection, counters: &Counters) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO counters(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )?;
    for (key, value) in counters.entries() {
        stmt.execute(params![key, to_i64(value)?])?;
    }
    Ok(())
}

fn write_dynamic(conn: &Connection, dynamic: &DynamicState) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO dynamic(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )?;
    stmt.execute(params!["now", serde_json::to_string(&dynamic.now)?])?;
    stmt.execute(params!["working_memory", serde_json::to_string(&dynamic.working_memory)?])?;
    Ok(())
}

fn to_i64(v: u64) -> Result<i64> {
    i64::try_from(v).with_context(|| format!("value {v} does not fit in an SQLite integer"))
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}
