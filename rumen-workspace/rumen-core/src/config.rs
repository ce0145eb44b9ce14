use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RumenError;

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logbook: LogbookConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.validate()?;
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    /// Reject values that would break the belief/trait range invariants.
    pub fn validate(&self) -> std::result::Result<(), RumenError> {
        let a = &self.aggregator;
        check(a.alpha > 0.0 && a.alpha <= 1.0, "aggregator.alpha must be in (0, 1]")?;
        check(a.conf_gain >= 0.0, "aggregator.conf_gain must be >= 0")?;
        check(unit(a.initial_confidence), "aggregator.initial_confidence must be in [0, 1]")?;
        check(unit(a.min_obs_conf), "aggregator.min_obs_conf must be in [0, 1]")?;
        check(unit(a.min_abs_value), "aggregator.min_abs_value must be in [0, 1]")?;
        check(a.min_delta >= 0.0 && a.min_delta <= 2.0, "aggregator.min_delta must be in [0, 2]")?;

        let r = &self.reflection;
        check(r.drift_threshold >= 0.0 && r.drift_threshold <= 2.0, "reflection.drift_threshold must be in [0, 2]")?;
        check(unit(r.conf_threshold), "reflection.conf_threshold must be in [0, 1]")?;
        check(unit(r.beta), "reflection.beta must be in [0, 1]")?;
        check(r.max_step >= 0.0 && r.max_step <= 2.0, "reflection.max_step must be in [0, 2]")?;
        for m in &r.mappings {
            check(
                !m.trait_name.trim().is_empty()
                    && !m.source_entity_type.trim().is_empty()
                    && !m.source_dimension.trim().is_empty(),
                "reflection.mappings entries need trait_name, source_entity_type and source_dimension",
            )?;
        }

        let s = &self.scheduler;
        check(s.rumination_window >= 1, "scheduler.rumination_window must be >= 1")?;
        check(s.max_records_keep >= 1, "scheduler.max_records_keep must be >= 1")?;
        Ok(())
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.memory.wal_path = absolutize(root, &self.memory.wal_path);
        self.memory.state_db_path = absolutize(root, &self.memory.state_db_path);
        self.memory.ontology_path = absolutize(root, &self.memory.ontology_path);
        self.logbook.aggregate = absolutize(root, &self.logbook.aggregate);
        self.logbook.reflection_log = absolutize(root, &self.logbook.reflection_log);
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            memory: MemoryConfig::default(),
            logbook: LogbookConfig::default(),
            services: ServicesConfig::default(),
            aggregator: AggregatorConfig::default(),
            reflection: ReflectionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "rumen".to_string()
    }

    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "MemoryConfig::default_wal_path")]
    pub wal_path: PathBuf,
    #[serde(default = "MemoryConfig::default_state_db_path")]
    pub state_db_path: PathBuf,
    /// Optional entity-type/dimension vocabulary. A missing file means "accept everything".
    #[serde(default = "MemoryConfig::default_ontology_path")]
    pub ontology_path: PathBuf,
}

impl MemoryConfig {
    fn default_wal_path() -> PathBuf {
        PathBuf::from("memory/observations.jsonl")
    }

    fn default_state_db_path() -> PathBuf {
        PathBuf::from("state/persona.db")
    }

    fn default_ontology_path() -> PathBuf {
        PathBuf::from("config/ontology.json")
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            wal_path: Self::default_wal_path(),
            state_db_path: Self::default_state_db_path(),
            ontology_path: Self::default_ontology_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    #[serde(default = "LogbookConfig::default_aggregate")]
    pub aggregate: PathBuf,
    #[serde(default = "LogbookConfig::default_reflection_log")]
    pub reflection_log: PathBuf,
}

impl LogbookConfig {
    fn default_aggregate() -> PathBuf {
        PathBuf::from("logbook.jsonl")
    }

    fn default_reflection_log() -> PathBuf {
        PathBuf::from("memory/reflection_log.jsonl")
    }
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            aggregate: Self::default_aggregate(),
            reflection_log: Self::default_reflection_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "ServicesConfig::default_true")]
    pub audit_enabled: bool,
    #[serde(default = "ServicesConfig::default_true")]
    pub reflection_enabled: bool,
}

impl ServicesConfig {
    fn default_true() -> bool {
        true
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            audit_enabled: true,
            reflection_enabled: true,
        }
    }
}

// -------------------------------------------------------------------------
// Aggregation (used by services::beliefs)
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// EMA weight of the incoming value.
    #[serde(default = "AggregatorConfig::default_alpha")]
    pub alpha: f64,
    /// Confidence gained per admitted observation, scaled by its own confidence.
    #[serde(default = "AggregatorConfig::default_conf_gain")]
    pub conf_gain: f64,
    #[serde(default = "AggregatorConfig::default_initial_confidence")]
    pub initial_confidence: f64,
    /// Gate A.
    #[serde(default = "AggregatorConfig::default_min_obs_conf")]
    pub min_obs_conf: f64,
    /// Gate B.
    #[serde(default = "AggregatorConfig::default_min_abs_value")]
    pub min_abs_value: f64,
    /// Gate C.
    #[serde(default = "AggregatorConfig::default_min_delta")]
    pub min_delta: f64,
}

impl AggregatorConfig {
    fn default_alpha() -> f64 {
        0.25
    }
    fn default_conf_gain() -> f64 {
        0.05
    }
    fn default_initial_confidence() -> f64 {
        0.2
    }
    fn default_min_obs_conf() -> f64 {
        0.75
    }
    fn default_min_abs_value() -> f64 {
        0.1
    }
    fn default_min_delta() -> f64 {
        0.01
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            alpha: Self::default_alpha(),
            conf_gain: Self::default_conf_gain(),
            initial_confidence: Self::default_initial_confidence(),
            min_obs_conf: Self::default_min_obs_conf(),
            min_abs_value: Self::default_min_abs_value(),
            min_delta: Self::default_min_delta(),
        }
    }
}

// -------------------------------------------------------------------------
// Reflection (used by services::reflection)
// -------------------------------------------------------------------------

/// One row of the trait <- belief source table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraitMapping {
    pub trait_name: String,
    pub source_entity_type: String,
    pub source_dimension: String,
}

impl TraitMapping {
    pub fn new(trait_name: &str, source_entity_type: &str, source_dimension: &str) -> Self {
        Self {
            trait_name: trait_name.to_string(),
            source_entity_type: source_entity_type.to_string(),
            source_dimension: source_dimension.to_string(),
        }
    }

    /// `person.*.warmth`
    pub fn source_label(&self) -> String {
        format!("{}.*.{}", self.source_entity_type, self.source_dimension)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "ReflectionConfig::default_drift_threshold")]
    pub drift_threshold: f64,
    #[serde(default = "ReflectionConfig::default_conf_threshold")]
    pub conf_threshold: f64,
    #[serde(default = "ReflectionConfig::default_min_obs")]
    pub min_obs: u64,
    #[serde(default = "ReflectionConfig::default_beta")]
    pub beta: f64,
    #[serde(default = "ReflectionConfig::default_max_step")]
    pub max_step: f64,
    /// Turns that must pass between two reflection runs (0 = every rumination).
    #[serde(default)]
    pub min_turns_between: u64,
    #[serde(default = "ReflectionConfig::default_max_logged_triggers")]
    pub max_logged_triggers: usize,
    #[serde(default = "ReflectionConfig::default_mappings")]
    pub mappings: Vec<TraitMapping>,
}

impl ReflectionConfig {
    fn default_drift_threshold() -> f64 {
        0.25
    }
    fn default_conf_threshold() -> f64 {
        0.70
    }
    fn default_min_obs() -> u64 {
        10
    }
    fn default_beta() -> f64 {
        0.05
    }
    fn default_max_step() -> f64 {
        0.08
    }
    fn default_max_logged_triggers() -> usize {
        50
    }
    fn default_mappings() -> Vec<TraitMapping> {
        vec![TraitMapping::new("trust", "person", "warmth")]
    }
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            drift_threshold: Self::default_drift_threshold(),
            conf_threshold: Self::default_conf_threshold(),
            min_obs: Self::default_min_obs(),
            beta: Self::default_beta(),
            max_step: Self::default_max_step(),
            min_turns_between: 0,
            max_logged_triggers: Self::default_max_logged_triggers(),
            mappings: Self::default_mappings(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Turns between two ruminations.
    #[serde(default = "SchedulerConfig::default_rumination_window")]
    pub rumination_window: u64,
    /// Log records older than `cursor - retention_turns` may be compacted away.
    #[serde(default = "SchedulerConfig::default_retention_turns")]
    pub retention_turns: u64,
    #[serde(default = "SchedulerConfig::default_max_records_keep")]
    pub max_records_keep: usize,
}

impl SchedulerConfig {
    fn default_rumination_window() -> u64 {
        20
    }
    fn default_retention_turns() -> u64 {
        200
    }
    fn default_max_records_keep() -> usize {
        5000
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rumination_window: Self::default_rumination_window(),
            retention_turns: Self::default_retention_turns(),
            max_records_keep: Self::default_max_records_keep(),
        }
    }
}

fn check(ok: bool, msg: &str) -> std::result::Result<(), RumenError> {
    if ok {
        Ok(())
    } else {
        Err(RumenError::InvalidConfig(msg.to_string()))
    }
}

fn unit(x: f64) -> bool {
    (0.0..=1.0).contains(&x)
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
