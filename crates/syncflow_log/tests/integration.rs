//! Integration tests for the action log.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use syncflow_log::{
    ActionLog, ActionRecord, Fields, FileJournal, FiringCommit, FlowId, Journal, RecordId,
};
use tempfile::tempdir;

fn completion(flow: FlowId, x: i64) -> ActionRecord {
    let mut output = Fields::new();
    output.insert("x".into(), json!(x));
    ActionRecord::completion("A", "emit", Fields::new(), "ok", output, flow)
}

#[test]
fn concurrent_commits_fire_once() {
    let log = Arc::new(ActionLog::new());
    let flow = FlowId::new();
    let a = completion(flow, 1);
    let b = completion(flow, 1);
    log.append(a.clone()).unwrap();
    log.append(b.clone()).unwrap();
    let matched = vec![a.id, b.id];

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let log = Arc::clone(&log);
            let matched = matched.clone();
            thread::spawn(move || {
                let inv = ActionRecord::invocation("C", "go", Fields::new(), flow).with_rule("Join");
                log.commit_firing("Join", &matched, vec![inv]).unwrap()
            })
        })
        .collect();

    let committed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(FiringCommit::is_committed)
        .count();
    assert_eq!(committed, 1);
    assert_eq!(log.outstanding_invocations(&flow).len(), 1);
}

#[test]
fn file_journal_recovery_keeps_exactly_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.journal");
    let flow = FlowId::new();
    let a = completion(flow, 1);
    {
        let journal = Arc::new(FileJournal::open(&path).unwrap());
        let log = ActionLog::with_journal(journal);
        log.append(a.clone()).unwrap();
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        log.commit_firing("R", &[a.id], vec![inv]).unwrap();
    }

    let journal: Arc<dyn Journal> = Arc::new(FileJournal::open(&path).unwrap());
    let log = ActionLog::recover(journal).unwrap();
    let retry = ActionRecord::invocation("C", "go", Fields::new(), flow);
    assert_eq!(
        log.commit_firing("R", &[a.id], vec![retry]).unwrap(),
        FiringCommit::AlreadyFired
    );

    let second = completion(flow, 2);
    log.append(second.clone()).unwrap();
    drop(log);
    let log = ActionLog::recover(Arc::new(FileJournal::open(&path).unwrap())).unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.contains(&second.id));
}

#[test]
fn appends_after_a_crash_survive_the_next_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.journal");
    let flow = FlowId::new();
    let first = completion(flow, 1);
    {
        let log = ActionLog::with_journal(Arc::new(FileJournal::open(&path).unwrap()));
        log.append(first.clone()).unwrap();
    }
    // half a frame header left behind by a crash
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&[7, 0]);
    std::fs::write(&path, bytes).unwrap();

    let second = completion(flow, 2);
    {
        let log = ActionLog::recover(Arc::new(FileJournal::open(&path).unwrap())).unwrap();
        assert_eq!(log.len(), 1);
        log.append(second.clone()).unwrap();
    }
    let log = ActionLog::recover(Arc::new(FileJournal::open(&path).unwrap())).unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.contains(&first.id));
    assert!(log.contains(&second.id));
}

proptest! {
    #[test]
    fn has_edge_is_order_insensitive(n in 1usize..6, rotate in 0usize..6) {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let ids: Vec<RecordId> = (0..n)
            .map(|i| log.append(completion(flow, i as i64)).unwrap())
            .collect();
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        log.commit_firing("R", &ids, vec![inv]).unwrap();

        let mut rotated = ids.clone();
        rotated.rotate_left(rotate % n);
        prop_assert!(log.has_edge(&rotated, "R"));
        if n > 1 {
            prop_assert!(!log.has_edge(&ids[1..], "R"));
        }
    }
}
