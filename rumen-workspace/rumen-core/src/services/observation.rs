//! services/observation.rs
//!
//! The record type that flows from the (external) extractor into the log,
//! plus the intake rules applied before anything is persisted:
//! - values are clamped to [-1, 1], confidence to [0, 1];
//! - non-string entity fields and empty names drop the payload;
//! - dimensions outside the active [`Vocabulary`] are dropped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Default confidence for payloads that omit or garble it.
pub const DEFAULT_PAYLOAD_CONFIDENCE: f64 = 0.5;

/// One rated entity. `turn` and `session_id` are stamped by the agent at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub turn: u64,
    #[serde(default)]
    pub session_id: String,
    pub entity_type: String,
    pub entity: String,
    #[serde(default)]
    pub dimension_values: BTreeMap<String, f64>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    DEFAULT_PAYLOAD_CONFIDENCE
}

impl Observation {
    pub fn new(entity_type: &str, entity: &str, confidence: f64) -> Self {
        Self {
            turn: 0,
            session_id: String::new(),
            entity_type: entity_type.to_string(),
            entity: entity.to_string(),
            dimension_values: BTreeMap::new(),
            confidence,
        }
    }

    /// Builder helper: `Observation::new("person", "mom", 0.9).with("warmth", 0.9)`.
    pub fn with(mut self, dimension: &str, value: f64) -> Self {
        self.dimension_values.insert(dimension.to_string(), value);
        self
    }

    pub fn stamped(mut self, turn: u64, session_id: &str) -> Self {
        self.turn = turn;
        self.session_id = session_id.to_string();
        self
    }

    /// Apply the intake clamps. Returns `None` when nothing usable is left.
    pub fn sanitized(mut self) -> Option<Self> {
        self.entity_type = self.entity_type.trim().to_string();
        self.entity = self.entity.trim().to_string();
        if self.entity_type.is_empty() || self.entity.is_empty() {
            return None;
        }
        self.dimension_values = self
            .dimension_values
            .into_iter()
            .filter_map(|(k, v)| {
                let k = k.trim().to_string();
                if k.is_empty() || !v.is_finite() {
                    return None;
                }
                Some((k, v.clamp(-1.0, 1.0)))
            })
            .collect();
        if self.dimension_values.is_empty() {
            return None;
        }
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            DEFAULT_PAYLOAD_CONFIDENCE
        };
        Some(self)
    }

    /// Lenient decoder for producer JSON.
    ///
    /// Accepts either `"dimension_values": {dim: value}` or the list form
    /// `"dimensions": [{"dimension": dim, "value": value}]`. Numbers may come
    /// as JSON numbers or numeric strings.
    pub fn from_payload(payload: &Value, vocab: &dyn Vocabulary) -> Option<Self> {
        let obj = payload.as_object()?;
        let entity_type = obj.get("entity_type")?.as_str()?.trim();
        let entity = obj.get("entity")?.as_str()?.trim();
        if entity_type.is_empty() || entity.is_empty() {
            return None;
        }

        let mut dims = BTreeMap::new();
        if let Some(map) = obj.get("dimension_values").and_then(Value::as_object) {
            for (k, v) in map {
                if let Some(x) = lenient_f64(v) {
                    dims.insert(k.clone(), x);
                }
            }
        }
        if let Some(list) = obj.get("dimensions").and_then(Value::as_array) {
            for item in list {
                let Some(k) = item.get("dimension").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(x) = item.get("value").and_then(lenient_f64) {
                    dims.insert(k.to_string(), x);
                }
            }
        }
        dims.retain(|k, _| vocab.allows(entity_type, k));

        let confidence = obj
            .get("confidence")
            .and_then(lenient_f64)
            .unwrap_or(DEFAULT_PAYLOAD_CONFIDENCE);

        Observation {
            turn: 0,
            session_id: String::new(),
            entity_type: entity_type.to_string(),
            entity: entity.to_string(),
            dimension_values: dims,
            confidence,
        }
        .sanitized()
    }

    /// Decode `{"entities": [...]}`, a bare array, or a single object.
    pub fn from_payload_batch(payload: &Value, vocab: &dyn Vocabulary) -> Vec<Self> {
        let items: Vec<&Value> = match payload {
            Value::Array(xs) => xs.iter().collect(),
            Value::Object(o) => match o.get("entities").and_then(Value::as_array) {
                Some(xs) => xs.iter().collect(),
                None => vec![payload],
            },
            _ => Vec::new(),
        };
        items
            .into_iter()
            .filter_map(|v| Self::from_payload(v, vocab))
            .collect()
    }
}

fn lenient_f64(v: &Value) -> Option<f64> {
    let x = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    x.is_finite().then_some(x)
}

// ---------- vocabulary ----------

/// Which dimensions are meaningful for which entity types.
/// The vocabulary belongs to the producer; the core only asks.
pub trait Vocabulary {
    fn allows(&self, entity_type: &str, dimension: &str) -> bool;
}

/// Accepts every (entity_type, dimension) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenVocabulary;

impl Vocabulary for OpenVocabulary {
    fn allows(&self, _entity_type: &str, _dimension: &str) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct OntologyFile {
    #[serde(default)]
    entity_types: BTreeMap<String, EntityTypeDef>,
}

#[derive(Debug, Deserialize)]
struct EntityTypeDef {
    #[serde(default)]
    dimensions: BTreeMap<String, Value>,
}

/// Closed vocabulary read from `ontology.json`:
/// `{"entity_types": {"person": {"dimensions": {"warmth": {...}}}}}`.
#[derive(Debug, Clone, Default)]
pub struct Ontology {
    entity_types: BTreeMap<String, BTreeSet<String>>,
}

impl Ontology {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading ontology {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing ontology {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: OntologyFile = serde_json::from_str(text)?;
        let entity_types = file
            .entity_types
            .into_iter()
            .map(|(et, def)| (et, def.dimensions.into_keys().collect()))
            .collect();
        Ok(Self { entity_types })
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entity_types.keys().map(String::as_str)
    }

    pub fn dimensions(&self, entity_type: &str) -> Option<&BTreeSet<String>> {
        self.entity_types.get(entity_type)
    }
}

impl Vocabulary for Ontology {
    fn allows(&self, entity_type: &str, dimension: &str) -> bool {
        self.entity_types
            .get(entity_type)
            .map(|dims| dims.contains(dimension))
            .unwrap_or(false)
    }
}

// ---------- extractor seam ----------

/// Turns free text into observations. Implemented outside the core
/// (an LLM tool call, a rules engine, a test stub).
pub trait Extractor {
    fn extract(&self, text: &str) -> Result<Vec<Observation>>;
}
