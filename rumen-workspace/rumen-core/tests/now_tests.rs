// tests/now_tests.rs
// Per-turn mood/scalar nudges and working memory.

use rumen_core::services::now::{
    DynamicState, Emotion, MAX_RECENT_ENTITIES, MOOD_STEP, NowState, SCALAR_STEP, WorkingMemory, nudge,
};
use rumen_core::services::observation::Observation;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

#[test]
fn starts_neutral() {
    let now = NowState::default();
    for e in Emotion::ALL {
        assert_eq!(now.mood.get(e), 0.5);
    }
    assert_eq!((now.arousal, now.stress, now.energy, now.confidence), (0.5, 0.5, 0.5, 0.5));
    assert!(now.current_topic.is_none());
}

#[test]
fn warm_person_lifts_trust_and_joy() {
    let mut now = NowState::default();
    now.observe(&[Observation::new("person", "Mom", 0.9).with("warmth", 0.9)], 4);

    assert!(close(now.mood.trust, 0.5 + MOOD_STEP * 0.36 / 3.0));
    assert!(close(now.mood.joy, 0.5 + MOOD_STEP * 0.135 / 3.0));
    assert_eq!(now.mood.fear, 0.5);
    assert_eq!(now.stress, 0.5);
    assert_eq!(now.current_topic.as_deref(), Some("mom"));
    assert_eq!(now.last_updated_turn, 4);
}

#[test]
fn calm_place_lowers_stress_and_arousal() {
    let mut now = NowState::default();
    let kitchen = Observation::new("place", "kitchen", 0.8)
        .with("comfort", 1.0)
        .with("quietness", 1.0);
    now.observe(&[kitchen], 1);

    assert!(close(now.stress, 0.5 - SCALAR_STEP * 0.25 / 2.0));
    assert!(close(now.arousal, 0.5 - SCALAR_STEP * 0.15 / 2.0));
    assert!(close(now.mood.joy, 0.5 + MOOD_STEP * 0.2 / 3.0));
}

#[test]
fn unstable_person_raises_stress_and_fear() {
    let mut now = NowState::default();
    now.observe(
        &[Observation::new("person", "boss", 0.9).with("emotional_stability", -0.8)],
        1,
    );
    assert!(close(now.stress, 0.5 + SCALAR_STEP * 0.4 / 2.0));
    assert!(close(now.mood.fear, 0.5 + MOOD_STEP * 0.2 / 3.0));
}

#[test]
fn per_turn_push_is_capped_and_values_stay_in_unit_range() {
    let stressed = Observation::new("self_state", "self", 1.0).with("stress", 1.0);
    let batch = vec![stressed; 4];

    let mut now = NowState::default();
    now.observe(&batch, 1);
    // 4 * 0.75 = 3.0, capped at 2.0, so one full step
    assert!(close(now.stress, 0.5 + SCALAR_STEP));

    for turn in 2..20 {
        now.observe(&batch, turn);
    }
    assert_eq!(now.stress, 1.0);

    assert_eq!(nudge(0.0, MOOD_STEP, -10.0, 3.0), 0.0);
}

#[test]
fn empty_turn_only_moves_the_turn_marker() {
    let mut dynamic = DynamicState::default();
    dynamic.observe(&[Observation::new("activity", "Running", 0.7).with("enjoyment", 0.4)], 1);
    let before = dynamic.clone();

    dynamic.observe(&[], 2);
    assert_eq!(dynamic.now.last_updated_turn, 2);
    assert_eq!(dynamic.now.mood, before.now.mood);
    assert_eq!(dynamic.now.current_topic.as_deref(), Some("running"));
    assert_eq!(dynamic.now.current_activity.as_deref(), Some("running"));
    assert_eq!(dynamic.working_memory, before.working_memory);
}

#[test]
fn working_memory_tracks_focus_and_keeps_the_newest_mentions() {
    let mut wm = WorkingMemory::default();
    wm.observe(
        &[
            Observation::new("person", "Mom", 0.9).with("warmth", 0.8),
            Observation::new("place", "Park", 0.8).with("comfort", 0.6),
            Observation::new("concept", "work", 0.7).with("valence", -0.3),
        ],
        1,
    );
    assert_eq!(wm.last_entity_focus.as_deref(), Some("work"));
    assert_eq!(wm.last_person_entity.as_deref(), Some("mom"));
    assert_eq!(wm.last_place_entity.as_deref(), Some("park"));

    // a turn without a person keeps the previous one
    wm.observe(&[Observation::new("place", "home", 0.8).with("comfort", 0.9)], 2);
    assert_eq!(wm.last_person_entity.as_deref(), Some("mom"));
    assert_eq!(wm.last_place_entity.as_deref(), Some("home"));

    for turn in 3..=60 {
        wm.observe(&[Observation::new("person", &format!("p{turn}"), 0.9).with("warmth", 0.1)], turn);
    }
    assert_eq!(wm.recent_entities.len(), MAX_RECENT_ENTITIES);
    assert_eq!(wm.recent_entities.back().unwrap().entity, "p60");
    assert_eq!(wm.recent_entities.front().unwrap().entity, "p11");
}
