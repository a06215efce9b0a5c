#![allow(clippy::unwrap_used)]

use serde_json::json;
use starcite_types::Seq;
use starcite_types::api::v1::Event;

use super::SessionLog;
use crate::error::Error;

fn event(seq: u64) -> Event {
    serde_json::from_value(json!({
        "seq": seq,
        "type": "content",
        "payload": { "text": format!("event {seq}") },
        "actor": "agent:assistant",
        "producer_id": "producer:test",
        "producer_seq": seq,
    }))
    .expect("valid event")
}

#[test]
fn applies_contiguous_batches_and_tracks_the_head() {
    let log = SessionLog::new();
    assert_eq!(log.apply_batch(&[event(1), event(2)]).unwrap(), 2);
    assert_eq!(log.apply_batch(&[event(3)]).unwrap(), 1);
    assert_eq!(log.last_seq(), Seq::new(3));
    let snapshot = log.snapshot();
    assert_eq!(snapshot.events.len(), 3);
    assert_eq!(snapshot.last_seq, Seq::new(3));
}

#[test]
fn skips_already_applied_events() {
    let log = SessionLog::new();
    log.apply_batch(&[event(1), event(2), event(3)]).unwrap();
    // an overlapping redelivery after a reconnect
    assert_eq!(log.apply_batch(&[event(2), event(3), event(4)]).unwrap(), 1);
    assert_eq!(log.last_seq(), Seq::new(4));
    assert_eq!(log.snapshot().events.len(), 4);
}

#[test]
fn rejects_batches_that_leave_a_hole() {
    let log = SessionLog::new();
    log.apply_batch(&[event(1), event(2), event(3), event(4)])
        .unwrap();
    let err = log.apply_batch(&[event(6)]).expect_err("gap");
    match err {
        Error::SessionLogGap { expected, got } => {
            assert_eq!(expected, Seq::new(5));
            assert_eq!(got, Seq::new(6));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // property: a rejected batch leaves the head unchanged
    assert_eq!(log.last_seq(), Seq::new(4));
    assert_eq!(log.snapshot().events.len(), 4);
}

#[test]
fn rejects_batches_with_internal_holes() {
    let log = SessionLog::new();
    let err = log.apply_batch(&[event(1), event(3)]).expect_err("gap");
    assert!(matches!(err, Error::SessionLogGap { .. }));
    assert_eq!(log.last_seq(), Seq::ZERO);
}

#[test]
fn retention_keeps_the_newest_events_but_not_the_head() {
    let log = SessionLog::new();
    log.set_max_events(Some(2));
    log.apply_batch(&[event(1), event(2), event(3), event(4)])
        .unwrap();
    let snapshot = log.snapshot();
    assert_eq!(snapshot.last_seq, Seq::new(4));
    let seqs: Vec<u64> = snapshot
        .events
        .iter()
        .map(|event| event.seq.into_inner())
        .collect();
    assert_eq!(seqs, vec![3, 4]);
}

#[tokio::test]
async fn subscribe_with_replay_sees_retained_events_in_order() {
    let log = SessionLog::new();
    log.apply_batch(&[event(1), event(2)]).unwrap();
    let mut subscription = log.subscribe(true);
    log.apply_batch(&[event(3)]).unwrap();
    for expected in 1..=3u64 {
        let got = subscription.next().await.expect("event");
        assert_eq!(got.seq, Seq::new(expected));
    }
}

#[tokio::test]
async fn subscribe_without_replay_only_sees_new_events() {
    let log = SessionLog::new();
    log.apply_batch(&[event(1), event(2)]).unwrap();
    let mut subscription = log.subscribe(false);
    log.apply_batch(&[event(3)]).unwrap();
    let got = subscription.next().await.expect("event");
    assert_eq!(got.seq, Seq::new(3));
    assert!(subscription.try_next().is_none());
}

#[test]
fn dropped_subscriptions_are_pruned() {
    let log = SessionLog::new();
    let first = log.subscribe(false);
    let _second = log.subscribe(false);
    assert_eq!(log.subscriber_count(), 2);
    drop(first);
    assert_eq!(log.subscriber_count(), 1);
}
