#![allow(clippy::unwrap_used)]

use super::{Client, ClientConfig, ListSessionsQuery};
use crate::error::Error;

#[test]
fn rejects_a_non_http_base_url() {
    let err = Client::new(ClientConfig::new("tcp://localhost:4800")).expect_err("must fail");
    assert!(matches!(err, Error::Config(_)), "got: {err:?}");
}

#[test]
fn session_handles_are_cached_by_id() {
    let client = Client::new(ClientConfig::new("http://localhost:4800")).unwrap();
    let first = client.session("s1");
    let second = client.session("s1");
    assert_eq!(
        first.identity().producer_id,
        second.identity().producer_id
    );
    let other = client.session("s2");
    assert_ne!(
        first.identity().producer_id,
        other.identity().producer_id
    );
}

#[tokio::test]
async fn rejects_empty_metadata_filter_keys() {
    let client = Client::new(ClientConfig::new("http://localhost:4800")).unwrap();
    let err = client
        .list_sessions(ListSessionsQuery {
            metadata: vec![("".to_owned(), "x".to_owned())],
            ..ListSessionsQuery::default()
        })
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::Config(_)), "got: {err:?}");

    let err = client
        .list_sessions(ListSessionsQuery {
            metadata: vec![("kind".to_owned(), "".to_owned())],
            ..ListSessionsQuery::default()
        })
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::Config(_)), "got: {err:?}");
}
