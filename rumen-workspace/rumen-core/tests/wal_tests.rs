// tests/wal_tests.rs
// Observation log: append/read/compact behaviour and corruption tolerance.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tempfile::{TempDir, tempdir};

use rumen_core::RumenError;
use rumen_core::services::observation::Observation;
use rumen_core::services::wal::ObservationLog;

fn log_in(dir: &TempDir) -> (PathBuf, ObservationLog) {
    let path = dir.path().join("memory").join("observations.jsonl");
    let log = ObservationLog::open(&path).expect("open log");
    (path, log)
}

fn obs(turn: u64, session: &str, entity: &str, warmth: f64) -> Observation {
    Observation::new("person", entity, 0.9)
        .with("warmth", warmth)
        .stamped(turn, session)
}

fn turns(log: &ObservationLog) -> Vec<u64> {
    log.read_range(0, u64::MAX, None)
        .unwrap()
        .iter()
        .map(|o| o.turn)
        .collect()
}

#[test]
fn compaction_applies_turn_bound_then_count_cap() {
    let dir = tempdir().unwrap();
    let (_, mut log) = log_in(&dir);
    for t in [10, 40, 60, 70, 90] {
        log.append(&[obs(t, "s1", "mom", 0.5)]).unwrap();
    }

    let report = log.compact(50, 2).unwrap();
    assert_eq!(turns(&log), vec![70, 90]);
    assert_eq!(report.before, 5);
    assert_eq!(report.kept, 2);
    assert_eq!(report.dropped_by_turn, 2);
    assert_eq!(report.dropped_by_cap, 1);
    assert!(report.rewrote());
}

#[test]
fn compaction_without_changes_leaves_file_alone() {
    let dir = tempdir().unwrap();
    let (path, mut log) = log_in(&dir);
    log.append(&[obs(5, "s1", "mom", 0.5), obs(6, "s1", "dad", 0.4)])
        .unwrap();
    let before = fs::read(&path).unwrap();

    let report = log.compact(0, 100).unwrap();
    assert!(!report.rewrote());
    assert_eq!(fs::read(&path).unwrap(), before);
    assert!(!path.with_file_name("observations.jsonl.tmp").exists());
}

#[test]
fn malformed_and_tampered_lines_are_skipped_then_dropped_by_compaction() {
    let dir = tempdir().unwrap();
    let (path, mut log) = log_in(&dir);
    log.append(&[obs(1, "s1", "mom", 0.9)]).unwrap();
    log.append(&[obs(2, "s1", "dad", 0.4)]).unwrap();

    // flip a value inside the first record without fixing its checksum
    let text = fs::read_to_string(&path).unwrap();
    let tampered = text.replacen("\"warmth\":0.9", "\"warmth\":0.1", 1);
    assert_ne!(text, tampered);
    fs::write(&path, tampered + "{not json at all\n").unwrap();

    let scan = log.scan().unwrap();
    assert_eq!(scan.malformed, 2);
    assert_eq!(scan.records.len(), 1);
    assert_eq!(scan.records[0].observation.entity, "dad");

    let report = log.compact(0, 100).unwrap();
    assert_eq!(report.malformed_dropped, 2);
    assert_eq!(report.kept, 1);
    assert_eq!(log.scan().unwrap().malformed, 0);
}

#[test]
fn torn_tail_does_not_swallow_the_next_append() {
    let dir = tempdir().unwrap();
    let (path, mut log) = log_in(&dir);
    log.append(&[obs(1, "s1", "mom", 0.9)]).unwrap();

    // simulate a crash halfway through writing a line
    let mut f = OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(br#"{"seq":2,"ts":"2024-01-01T00:00:00Z","obs":{"tu"#)
        .unwrap();
    drop(f);

    let mut log = ObservationLog::open(&path).unwrap();
    log.append(&[obs(2, "s1", "dad", 0.4)]).unwrap();

    let scan = log.scan().unwrap();
    assert_eq!(scan.malformed, 1);
    let entities: Vec<_> = scan
        .records
        .iter()
        .map(|r| r.observation.entity.as_str())
        .collect();
    assert_eq!(entities, vec!["mom", "dad"]);
}

#[test]
fn read_range_is_half_open_and_idempotent() {
    let dir = tempdir().unwrap();
    let (_, mut log) = log_in(&dir);
    log.append(&[obs(1, "a", "mom", 0.9), obs(2, "a", "dad", 0.3)])
        .unwrap();
    log.append(&[obs(2, "b", "sis", 0.7), obs(3, "a", "bro", 0.2)])
        .unwrap();

    let first = log.read_range(1, 2, None).unwrap();
    let second = log.read_range(1, 2, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|o| o.turn == 2));

    let only_b = log.read_range(0, 3, Some("b")).unwrap();
    assert_eq!(only_b.len(), 1);
    assert_eq!(only_b[0].entity, "sis");

    assert_eq!(log.count_range(0, 3, None).unwrap(), 4);
    assert_eq!(log.count_range(3, 3, None).unwrap(), 0);
}

#[test]
fn append_rejects_turn_regression_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let (_, mut log) = log_in(&dir);
    log.append(&[obs(5, "s1", "mom", 0.9)]).unwrap();

    let err = log.append(&[obs(4, "s1", "dad", 0.4)]).unwrap_err();
    assert_eq!(
        err.downcast_ref::<RumenError>(),
        Some(&RumenError::TurnRegression {
            last: 5,
            requested: 4
        })
    );

    // regression inside a batch rejects the whole batch
    assert!(
        log.append(&[obs(6, "s1", "a", 0.4), obs(5, "s1", "b", 0.4)])
            .is_err()
    );
    assert_eq!(turns(&log), vec![5]);

    // equal turns are fine
    log.append(&[obs(5, "s2", "dad", 0.4)]).unwrap();
    assert_eq!(log.len().unwrap(), 2);
}

#[test]
fn reopen_recovers_sequence_and_max_turn() {
    let dir = tempdir().unwrap();
    let (path, mut log) = log_in(&dir);
    assert_eq!(log.max_turn(), None);
    assert!(log.is_empty().unwrap());
    log.append(&[obs(3, "s1", "mom", 0.9), obs(7, "s1", "dad", 0.4)])
        .unwrap();
    drop(log);

    let mut log = ObservationLog::open(&path).unwrap();
    assert_eq!(log.max_turn(), Some(7));
    log.append(&[obs(8, "s1", "sis", 0.2)]).unwrap();

    let seqs: Vec<u64> = log.scan().unwrap().records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn append_rejects_non_finite_numbers_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let (_, mut log) = log_in(&dir);
    log.append(&[obs(1, "s1", "mom", 0.5)]).unwrap();

    let err = log
        .append(&[obs(2, "s1", "dad", 0.4), obs(2, "s1", "sis", f64::NAN)])
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<RumenError>(),
        Some(&RumenError::NonFiniteValue {
            turn: 2,
            entity_type: "person".into(),
            entity: "sis".into(),
        })
    );

    let mut bad_conf = obs(2, "s1", "dad", 0.4);
    bad_conf.confidence = f64::INFINITY;
    assert!(log.append(&[bad_conf]).is_err());

    assert_eq!(turns(&log), vec![1]);
    assert_eq!(log.scan().unwrap().malformed, 0);
    assert_eq!(log.max_turn(), Some(1));
}
