use serde_json::json;
use starcite_types::api::v1::Event;

use super::parse_frame;
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
fn parses_a_single_event_object() {
    let wire = serde_json::to_string(&event(1)).expect("serializes");
    let batch = parse_frame(&wire).expect("parses");
    assert_eq!(batch, vec![event(1)]);
}

#[test]
fn parses_an_ordered_array_of_events() {
    let wire = serde_json::to_string(&vec![event(1), event(2)]).expect("serializes");
    let batch = parse_frame(&wire).expect("parses");
    assert_eq!(batch, vec![event(1), event(2)]);
}

#[test]
fn rejects_invalid_json() {
    let err = parse_frame("{not json").expect_err("must fail");
    assert!(matches!(err, Error::Connection(_)), "got: {err:?}");
}

#[test]
fn rejects_an_empty_array() {
    let err = parse_frame("[]").expect_err("must fail");
    assert!(matches!(err, Error::Connection(_)), "got: {err:?}");
}

#[test]
fn rejects_events_that_miss_required_fields() {
    // no actor, no producer identity
    let err = parse_frame(r#"{"seq": 1, "type": "content", "payload": {}}"#).expect_err("must fail");
    assert!(matches!(err, Error::Connection(_)), "got: {err:?}");
}
