// tests/state_tests.rs
// SQLite state store and the commit cursor it persists.

use tempfile::tempdir;

use rumen_core::RumenError;
use rumen_core::config::AggregatorConfig;
use rumen_core::services::beliefs::{Aggregator, BeliefKey, BeliefStore};
use rumen_core::services::cursor::CommitCursor;
use rumen_core::services::now::DynamicState;
use rumen_core::services::observation::Observation;
use rumen_core::services::reflection::TraitVector;
use rumen_core::services::state::{Counters, StateStore};

fn folded_store() -> BeliefStore {
    let agg = Aggregator::new(AggregatorConfig::default());
    let mut store = BeliefStore::new();
    let batch = vec![
        Observation::new("person", "mom", 0.9).with("warmth", 0.9),
        Observation::new("place", "kitchen", 0.8).with("comfort", -0.4),
    ];
    agg.fold(&mut store, &batch, 4);
    store
}

#[test]
fn fresh_store_loads_empty_state() {
    let store = StateStore::open_in_memory().unwrap();
    assert_eq!(store.load_counters().unwrap(), Counters::default());
    assert!(store.load_beliefs().unwrap().is_empty());
    assert!(store.load_traits().unwrap().is_empty());
}

#[test]
fn commit_persists_beliefs_traits_and_counters_together() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("state").join("persona.db");

    let mut beliefs = folded_store();
    let expected = beliefs.snapshot().clone();
    let mut traits = TraitVector::new();
    traits.ensure("trust");
    let counters = Counters {
        current_turn: 4,
        turns_since_last_rumination: 0,
        rumination_window_size: 4,
        cursor: CommitCursor::new(4),
        last_rumination_turn: 4,
        last_reflection_turn: 4,
    };

    {
        let mut store = StateStore::open(&db).unwrap();
        let stats = store.commit(&mut beliefs, &traits, &counters, &DynamicState::default()).unwrap();
        assert_eq!(stats.beliefs_written, 2);
        assert_eq!(stats.traits_written, 1);
    }
    assert!(beliefs.dirty().is_empty());

    let store = StateStore::open(&db).unwrap();
    assert_eq!(store.load_counters().unwrap(), counters);
    let reloaded = store.load_beliefs().unwrap();
    assert_eq!(reloaded.snapshot(), &expected);
    assert!(reloaded.dirty().is_empty());
    assert_eq!(store.load_traits().unwrap(), traits);
}

#[test]
fn only_dirty_beliefs_are_rewritten() {
    let mut store = StateStore::open_in_memory().unwrap();
    let mut beliefs = folded_store();
    let traits = TraitVector::new();
    let mut counters = Counters::default();
    store.commit(&mut beliefs, &traits, &counters, &DynamicState::default()).unwrap();

    assert!(beliefs.rebaseline(&BeliefKey::new("person", "mom", "warmth"), 9));
    counters.current_turn = 9;
    let stats = store.commit(&mut beliefs, &traits, &counters, &DynamicState::default()).unwrap();
    assert_eq!(stats.beliefs_written, 1);

    let mom = *store
        .load_beliefs()
        .unwrap()
        .get("person", "mom", "warmth")
        .unwrap();
    assert_eq!(mom.baseline_turn, 9);
    assert_eq!(mom.baseline_mean, mom.mean);
}

#[test]
fn trait_updated_turn_moves_only_with_the_value() {
    let mut store = StateStore::open_in_memory().unwrap();
    let mut beliefs = BeliefStore::new();
    let mut traits = TraitVector::new();
    traits.ensure("trust");
    let mut counters = Counters {
        current_turn: 3,
        ..Counters::default()
    };
    store.commit(&mut beliefs, &traits, &counters, &DynamicState::default()).unwrap();
    assert_eq!(store.trait_updated_turn("trust").unwrap(), Some(3));

    counters.current_turn = 8;
    store.commit(&mut beliefs, &traits, &counters, &DynamicState::default()).unwrap();
    assert_eq!(store.trait_updated_turn("trust").unwrap(), Some(3));
    assert_eq!(store.trait_updated_turn("nope").unwrap(), None);
}

#[test]
fn save_counters_leaves_beliefs_alone() {
    let mut store = StateStore::open_in_memory().unwrap();
    let counters = Counters {
        current_turn: 2,
        turns_since_last_rumination: 2,
        rumination_window_size: 20,
        ..Counters::default()
    };
    store.save_counters(&counters).unwrap();
    assert_eq!(store.load_counters().unwrap(), counters);
    assert!(store.load_beliefs().unwrap().is_empty());
}

#[test]
fn cursor_bounds_and_monotonicity() {
    let mut cursor = CommitCursor::default();
    assert_eq!(cursor.pending_range(0), None);
    assert_eq!(cursor.pending_range(5), Some((0, 5)));

    cursor.advance(5).unwrap();
    assert!(cursor.is_folded(5));
    assert!(!cursor.is_folded(6));
    assert_eq!(cursor.pending_range(5), None);

    // standing still is allowed
    cursor.advance(5).unwrap();
    assert_eq!(
        cursor.advance(4),
        Err(RumenError::CursorRegression {
            current: 5,
            requested: 4
        })
    );
    assert_eq!(cursor.last_committed_turn(), 5);

    assert_eq!(cursor.retention_floor(200), 0);
    cursor.advance(250).unwrap();
    assert_eq!(cursor.retention_floor(200), 50);
}

#[test]
fn counters_serialize_cursor_under_its_persisted_name() {
    let counters = Counters {
        cursor: CommitCursor::new(12),
        ..Counters::default()
    };
    let v = serde_json::to_value(counters).unwrap();
    assert_eq!(v["last_buffer_committed_turn"], 12);
}

#[test]
fn dynamic_state_rides_along_with_turns_and_commits() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("persona.db");
    let mut store = StateStore::open(&db).unwrap();
    assert_eq!(store.load_dynamic().unwrap(), DynamicState::default());

    let mut dynamic = DynamicState::default();
    dynamic.observe(&[Observation::new("person", "Mom", 0.9).with("warmth", 0.9)], 1);
    let counters = Counters {
        current_turn: 1,
        turns_since_last_rumination: 1,
        ..Counters::default()
    };
    store.save_turn(&counters, &dynamic).unwrap();
    assert_eq!(store.load_counters().unwrap(), counters);
    assert_eq!(store.load_dynamic().unwrap(), dynamic);

    dynamic.observe(&[Observation::new("place", "kitchen", 0.8).with("comfort", 0.5)], 2);
    let mut beliefs = BeliefStore::new();
    store
        .commit(&mut beliefs, &TraitVector::new(), &counters, &dynamic)
        .unwrap();
    drop(store);

    let reloaded = StateStore::open(&db).unwrap().load_dynamic().unwrap();
    assert_eq!(reloaded, dynamic);
    assert_eq!(reloaded.working_memory.recent_entities.len(), 2);
    assert_eq!(reloaded.working_memory.last_person_entity.as_deref(), Some("mom"));
    assert_eq!(reloaded.working_memory.last_place_entity.as_deref(), Some("kitchen"));
}
