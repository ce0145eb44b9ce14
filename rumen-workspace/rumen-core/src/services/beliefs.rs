//! services/beliefs.rs
//!
//! Belief store + aggregator.
//!
//! Beliefs are keyed `(entity_type, entity, dimension)` and hold an
//! exponentially smoothed mean plus an evidence-accumulating confidence.
//! `Aggregator::fold` applies a batch of observations through three gates:
//! - A: drop the observation if its source confidence is below `min_obs_conf`;
//! - B: drop a dimension whose |value| is below `min_abs_value`;
//! - C: drop a dimension whose smoothed move is below `min_delta`
//!   (a dimension that has never been admitted always passes C).
//!
//! Only the aggregator touches mean/confidence/n/last_updated_turn; only the
//! reflection engine touches the baseline, and only through [`BeliefStore::rebaseline`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::AggregatorConfig;
use crate::services::observation::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeliefDimension {
    pub mean: f64,
    pub confidence: f64,
    pub n: u64,
    pub last_updated_turn: u64,
    pub baseline_mean: f64,
    pub baseline_turn: u64,
}

impl BeliefDimension {
    pub fn fresh(turn: u64, initial_confidence: f64) -> Self {
        Self {
            mean: 0.0,
            confidence: initial_confidence.clamp(0.0, 1.0),
            n: 0,
            last_updated_turn: turn,
            baseline_mean: 0.0,
            baseline_turn: turn,
        }
    }

    /// Distance of the current mean from the last reflection baseline.
    pub fn drift(&self) -> f64 {
        (self.mean - self.baseline_mean).abs()
    }

    fn clamped(mut self) -> Self {
        self.mean = clamp_signed(self.mean);
        self.baseline_mean = clamp_signed(self.baseline_mean);
        self.confidence = clamp_unit(self.confidence);
        self
    }
}

/// entity_type -> entity -> dimension -> belief
pub type BeliefMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, BeliefDimension>>>;

/// Fully qualified belief address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BeliefKey {
    pub entity_type: String,
    pub entity: String,
    pub dimension: String,
}

impl BeliefKey {
    pub fn new(entity_type: &str, entity: &str, dimension: &str) -> Self {
        Self {
            entity_type: normalize_key(entity_type),
            entity: normalize_key(entity),
            dimension: normalize_key(dimension),
        }
    }
}

/// Owned aggregate of every belief. Mutation goes through methods that keep
/// values inside their ranges; the set of touched keys is tracked so the
/// persistence layer only rewrites what changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeliefStore {
    beliefs: BeliefMap,
    dirty: BTreeSet<BeliefKey>,
}

impl BeliefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup with the same key normalization the aggregator applies.
    pub fn get(&self, entity_type: &str, entity: &str, dimension: &str) -> Option<&BeliefDimension> {
        let key = BeliefKey::new(entity_type, entity, dimension);
        self.get_key(&key)
    }

    pub fn get_key(&self, key: &BeliefKey) -> Option<&BeliefDimension> {
        self.beliefs
            .get(&key.entity_type)?
            .get(&key.entity)?
            .get(&key.dimension)
    }

    /// Every entity of `entity_type` that has a `dimension` belief.
    pub fn across_entities<'a>(
        &'a self,
        entity_type: &str,
        dimension: &str,
    ) -> impl Iterator<Item = (&'a str, &'a BeliefDimension)> + 'a {
        let dimension = normalize_key(dimension);
        self.beliefs
            .get(&normalize_key(entity_type))
            .into_iter()
            .flat_map(|entities| entities.iter())
            .filter_map(move |(entity, dims)| dims.get(&dimension).map(|b| (entity.as_str(), b)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BeliefKey, &BeliefDimension)> {
        self.beliefs.iter().flat_map(|(et, entities)| {
            entities.iter().flat_map(move |(e, dims)| {
                dims.iter().map(move |(d, b)| {
                    (
                        BeliefKey {
                            entity_type: et.clone(),
                            entity: e.clone(),
                            dimension: d.clone(),
                        },
                        b,
                    )
                })
            })
        })
    }

    pub fn len(&self) -> usize {
        self.beliefs
            .values()
            .flat_map(|entities| entities.values())
            .map(|dims| dims.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only nested view, suitable for handing to callers or serializing.
    pub fn snapshot(&self) -> &BeliefMap {
        &self.beliefs
    }

    /// Reset the drift reference of one belief. Returns false if it does not exist.
    pub fn rebaseline(&mut self, key: &BeliefKey, turn: u64) -> bool {
        let Some(b) = self.get_mut(key) else {
            return false;
        };
        b.baseline_mean = b.mean;
        b.baseline_turn = turn;
        self.dirty.insert(key.clone());
        true
    }

    /// Keys touched since the last [`take_dirty`](Self::take_dirty).
    pub fn dirty(&self) -> &BTreeSet<BeliefKey> {
        &self.dirty
    }

    pub fn take_dirty(&mut self) -> BTreeSet<BeliefKey> {
        std::mem::take(&mut self.dirty)
    }

    /// Import a belief (e.g. from a snapshot). Values are clamped and the
    /// key is marked dirty so the next commit persists it.
    pub fn insert(&mut self, key: BeliefKey, belief: BeliefDimension) {
        self.write(&key, belief);
    }

    /// Insert a belief read back from storage; not marked dirty.
    pub(crate) fn restore(&mut self, key: BeliefKey, belief: BeliefDimension) {
        self.put(&key, belief.clamped());
    }

    fn get_mut(&mut self, key: &BeliefKey) -> Option<&mut BeliefDimension> {
        self.beliefs
            .get_mut(&key.entity_type)?
            .get_mut(&key.entity)?
            .get_mut(&key.dimension)
    }

    fn write(&mut self, key: &BeliefKey, belief: BeliefDimension) {
        self.put(key, belief.clamped());
        self.dirty.insert(key.clone());
    }

    fn put(&mut self, key: &BeliefKey, belief: BeliefDimension) {
        self.beliefs
            .entry(key.entity_type.clone())
            .or_default()
            .entry(key.entity.clone())
            .or_default()
            .insert(key.dimension.clone(), belief);
    }
}

// ---------- aggregation ----------

/// Why a single (observation, dimension) pair was or was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { created: bool },
    LowSourceConfidence,
    WeakSignal,
    NotNovel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldReport {
    pub observations: usize,
    pub admitted: usize,
    pub created: usize,
    pub rejected_low_confidence: usize,
    pub rejected_weak: usize,
    pub rejected_not_novel: usize,
    pub skipped_invalid: usize,
}

impl FoldReport {
    fn record(&mut self, a: Admission) {
        match a {
            Admission::Admitted { created } => {
                self.admitted += 1;
                if created {
                    self.created += 1;
                }
            }
            Admission::LowSourceConfidence => self.rejected_low_confidence += 1,
            Admission::WeakSignal => self.rejected_weak += 1,
            Admission::NotNovel => self.rejected_not_novel += 1,
        }
    }
}

pub struct Aggregator {
    cfg: AggregatorConfig,
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self { cfg }
    }

    /// Fold `batch` into `store` as of `turn`.
    ///
    /// Not idempotent: replaying a batch counts it again. Callers must commit
    /// the cursor advance together with the result.
    pub fn fold(&self, store: &mut BeliefStore, batch: &[Observation], turn: u64) -> FoldReport {
        let mut report = FoldReport {
            observations: batch.len(),
            ..Default::default()
        };
        for obs in batch {
            let entity_type = normalize_key(&obs.entity_type);
            let entity = normalize_key(&obs.entity);
            if entity_type.is_empty() || entity.is_empty() {
                report.skipped_invalid += obs.dimension_values.len().max(1);
                continue;
            }
            let obs_conf = if obs.confidence.is_finite() {
                clamp_unit(obs.confidence)
            } else {
                0.0
            };
            for (dim, &value) in &obs.dimension_values {
                let dimension = normalize_key(dim);
                if dimension.is_empty() || !value.is_finite() {
                    report.skipped_invalid += 1;
                    continue;
                }
                let key = BeliefKey {
                    entity_type: entity_type.clone(),
                    entity: entity.clone(),
                    dimension,
                };
                let outcome = self.apply(store, &key, clamp_signed(value), obs_conf, turn);
                report.record(outcome);
            }
        }
        tracing::debug!(
            turn,
            observations = report.observations,
            admitted = report.admitted,
            created = report.created,
            "fold complete"
        );
        report
    }

    /// Run one (belief, value) pair through the gates and apply it if admitted.
    pub fn apply(
        &self,
        store: &mut BeliefStore,
        key: &BeliefKey,
        value: f64,
        obs_conf: f64,
        turn: u64,
    ) -> Admission {
        if obs_conf < self.cfg.min_obs_conf {
            return Admission::LowSourceConfidence;
        }
        if value.abs() < self.cfg.min_abs_value {
            return Admission::WeakSignal;
        }

        let existing = store.get_key(key).copied();
        let created = existing.is_none();
        let mut belief = existing.unwrap_or_else(|| BeliefDimension::fresh(turn, self.cfg.initial_confidence));

        let proposed = smooth(belief.mean, value, self.cfg.alpha);
        if belief.n > 0 && (proposed - belief.mean).abs() < self.cfg.min_delta {
            return Admission::NotNovel;
        }

        belief.mean = proposed;
        belief.n += 1;
        belief.last_updated_turn = turn;
        belief.confidence = clamp_unit(belief.confidence + self.cfg.conf_gain * obs_conf);
        store.write(key, belief);
        Admission::Admitted { created }
    }
}

/// `clamp((1 - alpha) * old + alpha * value, -1, 1)`
pub fn smooth(old_mean: f64, value: f64, alpha: f64) -> f64 {
    clamp_signed((1.0 - alpha) * old_mean + alpha * value)
}

/// Case/whitespace folding applied to every key segment.
pub fn normalize_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn clamp_signed(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(-1.0, 1.0) }
}

pub(crate) fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}
