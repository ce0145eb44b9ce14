//! services/now.rs
//!
//! Short-horizon state that moves every turn, unlike beliefs which only
//! move at rumination points.
//! - `NowState`: an eight-way mood vector plus arousal, stress, energy and
//!   confidence, all in [0, 1], nudged by small bounded steps from the
//!   turn's observations.
//! - `WorkingMemory`: the most recent entity mentions and the latest
//!   focus, person and place.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::services::beliefs::normalize_key;
use crate::services::observation::Observation;

pub const MOOD_STEP: f64 = 0.06;
pub const SCALAR_STEP: f64 = 0.08;
pub const MAX_RECENT_ENTITIES: usize = 50;

const MOOD_DELTA_CAP: f64 = 3.0;
const SCALAR_DELTA_CAP: f64 = 2.0;
const NEUTRAL: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emotion {
    Joy,
    Trust,
    Fear,
    Surprise,
    Sadness,
    Disgust,
    Anger,
    Anticipation,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Joy,
        Emotion::Trust,
        Emotion::Fear,
        Emotion::Surprise,
        Emotion::Sadness,
        Emotion::Disgust,
        Emotion::Anger,
        Emotion::Anticipation,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mood {
    pub joy: f64,
    pub trust: f64,
    pub fear: f64,
    pub surprise: f64,
    pub sadness: f64,
    pub disgust: f64,
    pub anger: f64,
    pub anticipation: f64,
}

impl Default for Mood {
    fn default() -> Self {
        Self {
            joy: NEUTRAL,
            trust: NEUTRAL,
            fear: NEUTRAL,
            surprise: NEUTRAL,
            sadness: NEUTRAL,
            disgust: NEUTRAL,
            anger: NEUTRAL,
            anticipation: NEUTRAL,
        }
    }
}

impl Mood {
    pub fn get(&self, emotion: Emotion) -> f64 {
        match emotion {
            Emotion::Joy => self.joy,
            Emotion::Trust => self.trust,
            Emotion::Fear => self.fear,
            Emotion::Surprise => self.surprise,
            Emotion::Sadness => self.sadness,
            Emotion::Disgust => self.disgust,
            Emotion::Anger => self.anger,
            Emotion::Anticipation => self.anticipation,
        }
    }

    fn slot(&mut self, emotion: Emotion) -> &mut f64 {
        match emotion {
            Emotion::Joy => &mut self.joy,
            Emotion::Trust => &mut self.trust,
            Emotion::Fear => &mut self.fear,
            Emotion::Surprise => &mut self.surprise,
            Emotion::Sadness => &mut self.sadness,
            Emotion::Disgust => &mut self.disgust,
            Emotion::Anger => &mut self.anger,
            Emotion::Anticipation => &mut self.anticipation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NowState {
    pub mood: Mood,
    pub arousal: f64,
    pub stress: f64,
    pub energy: f64,
    pub confidence: f64,
    /// Latest entity mentioned.
    pub current_topic: Option<String>,
    /// Latest `activity` entity mentioned.
    pub current_activity: Option<String>,
    pub last_updated_turn: u64,
}

impl Default for NowState {
    fn default() -> Self {
        Self {
            mood: Mood::default(),
            arousal: NEUTRAL,
            stress: NEUTRAL,
            energy: NEUTRAL,
            confidence: NEUTRAL,
            current_topic: None,
            current_activity: None,
            last_updated_turn: 0,
        }
    }
}

/// Signed pushes accumulated over one turn, before capping.
#[derive(Debug, Default)]
struct Nudges {
    mood: [f64; 8],
    arousal: f64,
    stress: f64,
    energy: f64,
    confidence: f64,
}

impl Nudges {
    fn mood(&mut self, emotion: Emotion, delta: f64) {
        self.mood[emotion as usize] += delta;
    }

    fn from_batch(batch: &[Observation]) -> Self {
        let mut n = Self::default();
        for o in batch {
            let dim = |name: &str| o.dimension_values.get(name).copied();
            match normalize_key(&o.entity_type).as_str() {
                "concept" => {
                    if let Some(v) = dim("valence") {
                        n.mood(Emotion::Joy, v * 0.75);
                        n.mood(Emotion::Sadness, -v * 0.50);
                    }
                }
                "person" => {
                    // an unstable person in context raises stress a little
                    if let Some(es) = dim("emotional_stability") {
                        n.stress -= es * 0.5;
                        n.mood(Emotion::Fear, -es * 0.25);
                    }
                    if let Some(w) = dim("warmth") {
                        n.mood(Emotion::Trust, w * 0.4);
                        n.mood(Emotion::Joy, w * 0.15);
                    }
                }
                "place" => {
                    if let Some(c) = dim("comfort") {
                        n.stress -= c * 0.25;
                        n.mood(Emotion::Joy, c * 0.2);
                    }
                    if let Some(q) = dim("quietness") {
                        n.arousal -= q * 0.15;
                    }
                }
                "self_state" => {
                    if let Some(v) = dim("stress") {
                        n.stress += v * 0.75;
                    }
                    if let Some(v) = dim("energy") {
                        n.energy += v * 0.75;
                    }
                    if let Some(v) = dim("confidence") {
                        n.confidence += v * 0.75;
                    }
                    if let Some(v) = dim("arousal") {
                        n.arousal += v * 0.75;
                    }
                }
                _ => {}
            }
        }
        n
    }
}

/// `value + step * (delta capped to ±cap, scaled to ±1)`, kept in [0, 1].
pub fn nudge(value: f64, step: f64, delta: f64, cap: f64) -> f64 {
    (value + step * delta.clamp(-cap, cap) / cap).clamp(0.0, 1.0)
}

impl NowState {
    /// Apply one turn's observations. Runs every turn, empty or not.
    pub fn observe(&mut self, batch: &[Observation], turn: u64) {
        let n = Nudges::from_batch(batch);
        for emotion in Emotion::ALL {
            let slot = self.mood.slot(emotion);
            *slot = nudge(*slot, MOOD_STEP, n.mood[emotion as usize], MOOD_DELTA_CAP);
        }
        self.stress = nudge(self.stress, SCALAR_STEP, n.stress, SCALAR_DELTA_CAP);
        self.energy = nudge(self.energy, SCALAR_STEP, n.energy, SCALAR_DELTA_CAP);
        self.confidence = nudge(self.confidence, SCALAR_STEP, n.confidence, SCALAR_DELTA_CAP);
        self.arousal = nudge(self.arousal, SCALAR_STEP, n.arousal, SCALAR_DELTA_CAP);

        if let Some(last) = batch.last() {
            self.current_topic = Some(normalize_key(&last.entity));
        }
        if let Some(activity) = latest_of_type(batch, "activity") {
            self.current_activity = Some(activity);
        }
        self.last_updated_turn = turn;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentEntity {
    pub turn: u64,
    pub entity_type: String,
    pub entity: String,
    pub confidence: f64,
    pub dimension_values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingMemory {
    /// Oldest first, at most [`MAX_RECENT_ENTITIES`].
    pub recent_entities: VecDeque<RecentEntity>,
    pub last_entity_focus: Option<String>,
    pub last_person_entity: Option<String>,
    pub last_place_entity: Option<String>,
}

impl WorkingMemory {
    pub fn observe(&mut self, batch: &[Observation], turn: u64) {
        let Some(last) = batch.last() else {
            return;
        };
        self.last_entity_focus = Some(normalize_key(&last.entity));
        if let Some(person) = latest_of_type(batch, "person") {
            self.last_person_entity = Some(person);
        }
        if let Some(place) = latest_of_type(batch, "place") {
            self.last_place_entity = Some(place);
        }

        for o in batch {
            self.recent_entities.push_back(RecentEntity {
                turn,
                entity_type: normalize_key(&o.entity_type),
                entity: normalize_key(&o.entity),
                confidence: o.confidence,
                dimension_values: o.dimension_values.clone(),
            });
        }
        while self.recent_entities.len() > MAX_RECENT_ENTITIES {
            self.recent_entities.pop_front();
        }
    }
}

/// Everything that moves per turn, persisted alongside the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicState {
    pub now: NowState,
    pub working_memory: WorkingMemory,
}

impl DynamicState {
    pub fn observe(&mut self, batch: &[Observation], turn: u64) {
        self.now.observe(batch, turn);
        self.working_memory.observe(batch, turn);
    }
}

fn latest_of_type(batch: &[Observation], entity_type: &str) -> Option<String> {
    batch
        .iter()
        .rev()
        .find(|o| normalize_key(&o.entity_type) == entity_type)
        .map(|o| normalize_key(&o.entity))
}
