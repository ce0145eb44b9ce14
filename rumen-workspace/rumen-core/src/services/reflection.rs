//! services/reflection.rs
//!
//! Drift-gated trait updates.
//!
//! Per mapping (`trait <- entity_type.*.dimension`), a belief triggers when
//! its drift from baseline, its confidence and its sample count all clear
//! their thresholds. Triggered beliefs feed a confidence-weighted signal; the
//! trait moves toward it by `beta`, never more than `max_step` per run. Only
//! triggered beliefs are re-baselined.
//!
//! Every mapping sees the same pre-run belief state. Trait moves and baseline
//! resets are applied after all mappings have been evaluated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::{ReflectionConfig, TraitMapping};
use crate::services::beliefs::{BeliefKey, BeliefStore, clamp_signed, normalize_key};

// ---------- traits ----------

/// Flat `trait_name -> [-1, 1]` map. Missing traits read as 0.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraitVector {
    traits: BTreeMap<String, f64>,
}

impl TraitVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> f64 {
        self.traits.get(name).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.traits.contains_key(name)
    }

    /// Materialize a trait at 0.0 if it does not exist yet.
    pub fn ensure(&mut self, name: &str) {
        self.traits.entry(name.to_string()).or_insert(0.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.traits.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.traits
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    pub(crate) fn set(&mut self, name: &str, value: f64) {
        self.traits.insert(name.to_string(), clamp_signed(value));
    }
}

// ---------- audit records ----------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingRef {
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub drift: f64,
    pub confidence: f64,
    pub min_obs: u64,
    pub beta: f64,
    pub max_step: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraitUpdate {
    pub old: f64,
    pub signal: f64,
    pub delta: f64,
    pub new: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggeredBelief {
    pub entity: String,
    pub dimension: String,
    pub mean: f64,
    pub baseline_mean: f64,
    pub drift: f64,
    pub confidence: f64,
    pub n: u64,
}

/// One line of `reflection_log.jsonl`. Written once, never read back by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReflectionLogEntry {
    pub run_id: String,
    pub ts: DateTime<Utc>,
    pub turn: u64,
    pub did_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub mapping: MappingRef,
    pub thresholds: Thresholds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trait_update: Option<TraitUpdate>,
    pub triggered_count: usize,
    #[serde(default)]
    pub triggered: Vec<TriggeredBelief>,
}

/// Outcome of one engine run across every mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReflectionRun {
    pub updated: bool,
    pub entries: Vec<ReflectionLogEntry>,
    pub rebaselined: usize,
}

impl ReflectionRun {
    pub fn trait_updates(&self) -> impl Iterator<Item = (&str, &TraitUpdate)> {
        self.entries
            .iter()
            .filter_map(|e| e.trait_update.as_ref().map(|u| (e.mapping.trait_name.as_str(), u)))
    }
}

// ---------- engine ----------

pub struct DriftEngine {
    cfg: ReflectionConfig,
}

struct Evaluation {
    mapping: TraitMapping,
    triggered: Vec<(BeliefKey, TriggeredBelief)>,
    signal: Option<f64>,
    had_sources: bool,
}

impl DriftEngine {
    pub fn new(cfg: ReflectionConfig) -> Self {
        Self { cfg }
    }

    pub fn mappings(&self) -> &[TraitMapping] {
        &self.cfg.mappings
    }

    /// Evaluate every mapping at `turn`. Returns the audit entries and
    /// whether any trait moved; the caller persists both.
    pub fn run(&self, beliefs: &mut BeliefStore, traits: &mut TraitVector, turn: u64) -> ReflectionRun {
        let run_id = Uuid::new_v4().to_string();
        let ts = Utc::now();
        let thresholds = self.thresholds();

        // 1) evaluate against the untouched state
        let evaluations: Vec<Evaluation> = self
            .cfg
            .mappings
            .iter()
            .map(|m| self.evaluate(beliefs, m))
            .collect();

        // 2) apply
        let mut run = ReflectionRun::default();
        let mut to_rebaseline: BTreeSet<BeliefKey> = BTreeSet::new();
        for ev in evaluations {
            traits.ensure(&ev.mapping.trait_name);
            let mapping_ref = MappingRef {
                trait_name: ev.mapping.trait_name.clone(),
                source: ev.mapping.source_label(),
            };

            let Some(signal) = ev.signal else {
                let reason = if ev.had_sources {
                    "no_beliefs_triggered"
                } else {
                    "no_source_beliefs"
                };
                run.entries.push(ReflectionLogEntry {
                    run_id: run_id.clone(),
                    ts,
                    turn,
                    did_update: false,
                    reason: Some(reason.to_string()),
                    mapping: mapping_ref,
                    thresholds: thresholds.clone(),
                    trait_update: None,
                    triggered_count: 0,
                    triggered: Vec::new(),
                });
                continue;
            };

            let old = traits.get(&ev.mapping.trait_name);
            let (delta, new) = step_trait(old, signal, self.cfg.beta, self.cfg.max_step);
            traits.set(&ev.mapping.trait_name, new);
            run.updated = true;

            tracing::info!(
                turn,
                trait_name = %ev.mapping.trait_name,
                old,
                signal,
                new,
                triggered = ev.triggered.len(),
                "trait updated"
            );

            let triggered_count = ev.triggered.len();
            let mut logged = Vec::with_capacity(triggered_count.min(self.cfg.max_logged_triggers));
            for (key, item) in ev.triggered {
                to_rebaseline.insert(key);
                if logged.len() < self.cfg.max_logged_triggers {
                    logged.push(item);
                }
            }
            run.entries.push(ReflectionLogEntry {
                run_id: run_id.clone(),
                ts,
                turn,
                did_update: true,
                reason: None,
                mapping: mapping_ref,
                thresholds: thresholds.clone(),
                trait_update: Some(TraitUpdate {
                    old,
                    signal,
                    delta,
                    new,
                }),
                triggered_count,
                triggered: logged,
            });
        }

        for key in &to_rebaseline {
            if beliefs.rebaseline(key, turn) {
                run.rebaselined += 1;
            }
        }
        run
    }

    /// Conjunctive trigger test for one belief.
    pub fn triggers(&self, drift: f64, confidence: f64, n: u64) -> bool {
        drift >= self.cfg.drift_threshold && confidence >= self.cfg.conf_threshold && n >= self.cfg.min_obs
    }

    fn evaluate(&self, beliefs: &BeliefStore, mapping: &TraitMapping) -> Evaluation {
        let entity_type = normalize_key(&mapping.source_entity_type);
        let dimension = normalize_key(&mapping.source_dimension);

        let mut had_sources = false;
        let mut triggered = Vec::new();
        for (entity, b) in beliefs.across_entities(&entity_type, &dimension) {
            had_sources = true;
            let drift = b.drift();
            if !self.triggers(drift, b.confidence, b.n) {
                continue;
            }
            triggered.push((
                BeliefKey {
                    entity_type: entity_type.clone(),
                    entity: entity.to_string(),
                    dimension: dimension.clone(),
                },
                TriggeredBelief {
                    entity: entity.to_string(),
                    dimension: dimension.clone(),
                    mean: b.mean,
                    baseline_mean: b.baseline_mean,
                    drift,
                    confidence: b.confidence,
                    n: b.n,
                },
            ));
        }

        let signal = weighted_signal(triggered.iter().map(|(_, t)| (t.mean, t.confidence)));
        Evaluation {
            mapping: mapping.clone(),
            triggered,
            signal,
            had_sources,
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            drift: self.cfg.drift_threshold,
            confidence: self.cfg.conf_threshold,
            min_obs: self.cfg.min_obs,
            beta: self.cfg.beta,
            max_step: self.cfg.max_step,
        }
    }
}

/// `clamp(sum(mean_i * conf_i) / sum(conf_i), -1, 1)`; `None` for an empty
/// input, `Some(0.0)` when every weight is zero.
pub fn weighted_signal(items: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let mut any = false;
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (mean, conf) in items {
        any = true;
        weighted += mean * conf;
        total += conf;
    }
    if !any {
        return None;
    }
    Some(if total > 0.0 { clamp_signed(weighted / total) } else { 0.0 })
}

/// Rate-limited move of `old` toward `signal`. Returns `(delta, new)`.
pub fn step_trait(old: f64, signal: f64, beta: f64, max_step: f64) -> (f64, f64) {
    let desired = old + beta * (signal - old);
    let delta = (desired - old).clamp(-max_step, max_step);
    let new = clamp_signed(old + delta);
    (delta, new)
}
