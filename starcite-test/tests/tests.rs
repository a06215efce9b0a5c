use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use starcite_client::{
    AppendInput, ChatTransport, ConsumeOptions, Error, InMemoryCursorStore, ProducerIdentity,
    SendMessagesInput, StreamEndReason, TailLifecycleEvent, TailOptions, TailStream, UiMessage,
    UiMessageChunk, UiMessagePart, WsAuth,
};
use starcite_client::{Client, ClientConfig, CursorStore as _, ListSessionsQuery};
use starcite_test::{client_for, fast_tail_options};
use starcite_test_utils::spawn_server;
use starcite_types::api::v1::{CreateSessionRequest, Event, IssueSessionTokenRequest, SessionScope};
use starcite_types::{Seq, SessionId};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn user_message(text: &str) -> UiMessage {
    UiMessage {
        id: "m-user".to_owned(),
        role: "user".to_owned(),
        parts: vec![UiMessagePart::Text {
            text: text.to_owned(),
        }],
    }
}

type LifecycleRecorder = Arc<Mutex<Vec<TailLifecycleEvent>>>;

fn recording_options(options: TailOptions) -> (TailOptions, LifecycleRecorder) {
    let recorder: LifecycleRecorder = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&recorder);
    let options = TailOptions {
        on_lifecycle: Some(Arc::new(move |event| sink.lock().push(event.clone()))),
        ..options
    };
    (options, recorder)
}

async fn next_event(stream: &mut TailStream) -> eyre::Result<Option<Event>> {
    match tokio::time::timeout(TEST_TIMEOUT, stream.next_event()).await? {
        Some(item) => Ok(Some(item?)),
        None => Ok(None),
    }
}

#[tokio::test]
async fn append_then_catch_up_tail_sees_the_event() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s1")),
            ..CreateSessionRequest::default()
        })
        .await?;

    let session = client.session("s1");
    let response = session.append(AppendInput::text("hi")).await?;
    assert_eq!(response.seq, Seq::new(1));
    assert_eq!(response.last_seq, Seq::new(1));
    assert!(!response.deduped);

    let (options, recorder) = recording_options(TailOptions {
        follow: false,
        catch_up_idle: Duration::from_millis(200),
        ..fast_tail_options()
    });
    let mut stream = session.tail(options)?;
    let event = next_event(&mut stream).await?.expect("one event");
    assert_eq!(event.seq, Seq::new(1));
    assert_eq!(event.payload.get("text"), Some(&json!("hi")));
    assert!(next_event(&mut stream).await?.is_none());
    assert!(recorder.lock().iter().any(|event| matches!(
        event,
        TailLifecycleEvent::StreamEnded {
            reason: StreamEndReason::CaughtUp
        }
    )));
    Ok(())
}

#[tokio::test]
async fn reconnect_resumes_strictly_after_the_delivered_cursor() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s2")),
            ..CreateSessionRequest::default()
        })
        .await?;
    let session = client.session("s2");
    for n in 1..=3 {
        session.append(AppendInput::text(format!("event {n}"))).await?;
    }

    // the first tail connection dies abruptly after replaying the backlog
    server.faults.drop_tail_after(3);
    let (options, recorder) = recording_options(fast_tail_options());
    let mut stream = session.tail(options)?;

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_event(&mut stream).await?.expect("event").seq);
    }
    assert_eq!(seen, vec![Seq::new(1), Seq::new(2), Seq::new(3)]);

    // appended while the client is reconnecting; must arrive exactly once
    session.append(AppendInput::text("event 4")).await?;
    let fourth = next_event(&mut stream).await?.expect("event");
    assert_eq!(fourth.seq, Seq::new(4));
    assert_eq!(stream.cursor(), Seq::new(4));

    let recorded = recorder.lock();
    assert!(
        recorded
            .iter()
            .any(|event| matches!(event, TailLifecycleEvent::StreamDropped { .. })),
        "expected a StreamDropped event, got: {recorded:?}"
    );
    assert!(
        recorded
            .iter()
            .any(|event| matches!(event, TailLifecycleEvent::ReconnectScheduled { .. })),
        "expected a ReconnectScheduled event, got: {recorded:?}"
    );
    drop(recorded);
    stream.abort();
    Ok(())
}

#[tokio::test]
async fn consume_checkpoints_after_each_handled_event() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s3")),
            ..CreateSessionRequest::default()
        })
        .await?;
    let session = client.session("s3");
    for n in 1..=3 {
        session.append(AppendInput::text(format!("event {n}"))).await?;
    }

    let store = Arc::new(InMemoryCursorStore::new());
    let session_id = SessionId::from("s3");

    // the handler accepts seq 1 and rejects seq 2
    let error = session
        .consume(
            ConsumeOptions {
                cursor: None,
                cursor_store: Arc::clone(&store) as Arc<dyn starcite_client::CursorStore>,
                tail: TailOptions {
                    follow: false,
                    catch_up_idle: Duration::from_millis(200),
                    ..fast_tail_options()
                },
            },
            |event| async move {
                if event.seq == Seq::new(2) {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            },
        )
        .await
        .expect_err("handler failure must surface");
    assert!(matches!(error, Error::Handler { seq, .. } if seq == Seq::new(2)));
    assert_eq!(store.load(&session_id).await.unwrap(), Some(Seq::new(1)));

    // the second run resumes after the checkpoint and sees seq 2 first
    let handled: Arc<Mutex<Vec<Seq>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&handled);
    session
        .consume(
            ConsumeOptions {
                cursor: None,
                cursor_store: Arc::clone(&store) as Arc<dyn starcite_client::CursorStore>,
                tail: TailOptions {
                    follow: false,
                    catch_up_idle: Duration::from_millis(200),
                    ..fast_tail_options()
                },
            },
            move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(event.seq);
                    Ok(())
                }
            },
        )
        .await?;
    assert_eq!(*handled.lock(), vec![Seq::new(2), Seq::new(3)]);
    assert_eq!(store.load(&session_id).await.unwrap(), Some(Seq::new(3)));
    Ok(())
}

#[tokio::test]
async fn retrying_the_same_producer_seq_dedupes() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s4")),
            ..CreateSessionRequest::default()
        })
        .await?;

    let identity = ProducerIdentity {
        producer_id: "p1".to_owned(),
        actor: "user:p1".to_owned(),
        last_producer_seq: 0,
    };
    let first = client
        .session_with_identity("s4", identity.clone())
        .append(AppendInput::text("hi"))
        .await?;
    assert!(!first.deduped);

    // a rebooted producer retrying (p1, 1) with the same payload
    let second = client
        .session_with_identity("s4", identity)
        .append(AppendInput::text("hi"))
        .await?;
    assert_eq!(second.seq, first.seq);
    assert!(second.deduped);
    Ok(())
}

#[tokio::test]
async fn subscribe_delivers_each_event_exactly_once_across_reconnects() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s5")),
            ..CreateSessionRequest::default()
        })
        .await?;
    let session = client.session("s5");
    session.append(AppendInput::text("event 1")).await?;
    session.append(AppendInput::text("event 2")).await?;

    // the first sync connection dies right after the backlog
    server.faults.drop_tail_after(2);
    let mut subscription = session.subscribe(false);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(TEST_TIMEOUT, subscription.next())
            .await?
            .expect("event");
        seen.push(event.seq);
    }

    session.append(AppendInput::text("event 3")).await?;
    session.append(AppendInput::text("event 4")).await?;
    for _ in 0..2 {
        let event = tokio::time::timeout(TEST_TIMEOUT, subscription.next())
            .await?
            .expect("event");
        seen.push(event.seq);
    }
    assert_eq!(
        seen,
        vec![Seq::new(1), Seq::new(2), Seq::new(3), Seq::new(4)]
    );
    assert!(subscription.try_next().is_none(), "no duplicates");
    assert_eq!(session.log().last_seq(), Seq::new(4));
    Ok(())
}

#[tokio::test]
async fn chat_adapter_projects_the_assistant_answer() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    let chat = ChatTransport::new(client.clone());

    let mut stream = chat
        .send_messages(SendMessagesInput {
            chat_id: "c1".to_owned(),
            messages: vec![user_message("Hello")],
            trigger: "submit-message".to_owned(),
            message_id: None,
            cancel: None,
        })
        .await?;

    // the assistant answers through its own producer
    let assistant = client.session_with_identity(
        "c1",
        ProducerIdentity {
            producer_id: "producer:assistant".to_owned(),
            actor: "agent:assistant".to_owned(),
            last_producer_seq: 0,
        },
    );
    assistant
        .append(AppendInput {
            payload: Some(
                json!({ "text": "Hi!", "messageId": "m1", "textPartId": "p1" })
                    .as_object()
                    .cloned()
                    .expect("object"),
            ),
            ..AppendInput::default()
        })
        .await?;

    let mut chunks = Vec::new();
    while let Some(chunk) = tokio::time::timeout(TEST_TIMEOUT, stream.next_chunk()).await? {
        chunks.push(chunk?);
    }
    assert_eq!(
        chunks,
        vec![
            UiMessageChunk::Start {
                message_id: "m1".to_owned()
            },
            UiMessageChunk::TextStart {
                id: "p1".to_owned()
            },
            UiMessageChunk::TextDelta {
                id: "p1".to_owned(),
                delta: "Hi!".to_owned()
            },
            UiMessageChunk::TextEnd {
                id: "p1".to_owned()
            },
            UiMessageChunk::Finish {
                finish_reason: "stop".to_owned()
            },
        ]
    );

    // a remembered cursor allows reattaching; an unknown chat does not
    assert!(chat.reconnect_to_stream("c1", None)?.is_some());
    assert!(chat.reconnect_to_stream("unknown", None)?.is_none());
    Ok(())
}

#[tokio::test]
async fn abort_before_the_first_frame_ends_the_stream_cleanly() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s7")),
            ..CreateSessionRequest::default()
        })
        .await?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let (options, recorder) = recording_options(TailOptions {
        cancel: Some(cancel.clone()),
        ..fast_tail_options()
    });
    let mut stream = client.session("s7").tail(options)?;
    cancel.cancel();

    let ended = tokio::time::timeout(TEST_TIMEOUT, stream.next_batch()).await?;
    assert!(ended.is_none(), "no error on abort: {ended:?}");
    assert!(recorder.lock().iter().any(|event| matches!(
        event,
        TailLifecycleEvent::StreamEnded {
            reason: StreamEndReason::Aborted
        }
    )));
    Ok(())
}

#[tokio::test]
async fn producer_seq_counts_every_append_call() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    let session = client.session("s8");

    // the session does not exist yet, so the first append fails
    let error = session
        .append(AppendInput::text("too early"))
        .await
        .expect_err("session does not exist");
    assert!(matches!(error, Error::Api { status: 404, .. }), "got: {error:?}");

    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s8")),
            ..CreateSessionRequest::default()
        })
        .await?;
    session.append(AppendInput::text("second call")).await?;

    // the failed call consumed producer_seq 1, the successful one used 2
    assert_eq!(session.identity().last_producer_seq, 2);
    let mut stream = session.tail(TailOptions {
        follow: false,
        catch_up_idle: Duration::from_millis(200),
        ..fast_tail_options()
    })?;
    let event = next_event(&mut stream).await?.expect("event");
    assert_eq!(event.producer_seq.into_inner(), 2);
    Ok(())
}

#[tokio::test]
async fn minted_session_tokens_authorize_query_param_tails() -> eyre::Result<()> {
    let server = starcite_test_utils::spawn_server_with_api_key(Some("key1".to_owned())).await?;

    let anonymous = Client::new(ClientConfig::new(server.base_url.clone()))?;
    let error = anonymous
        .create_session(CreateSessionRequest::default())
        .await
        .expect_err("must be unauthorized");
    assert!(matches!(error, Error::Api { status: 401, .. }), "got: {error:?}");

    let operator = Client::new(
        ClientConfig::new(server.base_url.clone()).with_api_key("key1"),
    )?;
    operator
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s9")),
            ..CreateSessionRequest::default()
        })
        .await?;
    operator.session("s9").append(AppendInput::text("hi")).await?;

    let minted = operator
        .issue_session_token(IssueSessionTokenRequest {
            session_id: SessionId::from("s9"),
            principal: "user:alice".to_owned(),
            scopes: vec![SessionScope::Read],
            ttl_seconds: Some(60),
        })
        .await?;
    assert!(minted.expires_in > 0);

    let reader = Client::new(
        ClientConfig::new(server.base_url.clone())
            .with_session_token(minted.token)
            .with_ws_auth(WsAuth::QueryParam),
    )?;
    let mut stream = reader.session("s9").tail(TailOptions {
        follow: false,
        catch_up_idle: Duration::from_millis(200),
        ..fast_tail_options()
    })?;
    let event = next_event(&mut stream).await?.expect("event");
    assert_eq!(event.seq, Seq::new(1));
    Ok(())
}

#[tokio::test]
async fn expired_tokens_surface_as_token_expired() -> eyre::Result<()> {
    let server = starcite_test_utils::spawn_server_with_api_key(Some("key1".to_owned())).await?;
    let client = Client::new(
        ClientConfig::new(server.base_url.clone()).with_api_key("key1"),
    )?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s10")),
            ..CreateSessionRequest::default()
        })
        .await?;

    server.faults.expire_tokens();
    let mut stream = client.session("s10").tail(fast_tail_options())?;
    let item = tokio::time::timeout(TEST_TIMEOUT, stream.next_batch()).await?;
    match item {
        Some(Err(Error::TokenExpired)) => {}
        other => panic!("expected TokenExpired, got: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn a_token_expiring_mid_stream_surfaces_and_preserves_the_cursor() -> eyre::Result<()> {
    let server = starcite_test_utils::spawn_server_with_api_key(Some("key1".to_owned())).await?;
    let client = Client::new(
        ClientConfig::new(server.base_url.clone()).with_api_key("key1"),
    )?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s14")),
            ..CreateSessionRequest::default()
        })
        .await?;
    let session = client.session("s14");
    session.append(AppendInput::text("event 1")).await?;
    session.append(AppendInput::text("event 2")).await?;

    // the handshake succeeds; the token ages out on the live socket
    server.faults.expire_mid_stream(2);
    let mut stream = session.tail(fast_tail_options())?;
    let first = next_event(&mut stream).await?.expect("event");
    let second = next_event(&mut stream).await?.expect("event");
    assert_eq!(first.seq, Seq::new(1));
    assert_eq!(second.seq, Seq::new(2));

    let item = tokio::time::timeout(TEST_TIMEOUT, stream.next_batch()).await?;
    match item {
        Some(Err(Error::TokenExpired)) => {}
        other => panic!("expected TokenExpired, got: {other:?}"),
    }
    // nothing delivered was lost: the cursor still marks the last event
    let cursor = stream.cursor();
    assert_eq!(cursor, Seq::new(2));

    // with a fresh credential the tail resumes strictly after the cursor
    session.append(AppendInput::text("event 3")).await?;
    let mut resumed = session.tail(TailOptions {
        cursor,
        follow: false,
        catch_up_idle: Duration::from_millis(200),
        ..fast_tail_options()
    })?;
    let third = next_event(&mut resumed).await?.expect("event");
    assert_eq!(third.seq, Seq::new(3));
    assert!(next_event(&mut resumed).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn an_overwhelmed_consumer_fails_with_backpressure() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s11")),
            ..CreateSessionRequest::default()
        })
        .await?;
    let session = client.session("s11");
    for n in 1..=5 {
        session.append(AppendInput::text(format!("event {n}"))).await?;
    }

    // one-frame batches into a single-slot buffer, with nobody reading
    let mut stream = session.tail(TailOptions {
        batch_size: 1,
        max_buffered_batches: 1,
        ..fast_tail_options()
    })?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let first = tokio::time::timeout(TEST_TIMEOUT, stream.next_batch()).await?;
    assert!(matches!(first, Some(Ok(ref batch)) if batch.len() == 1), "got: {first:?}");
    let second = tokio::time::timeout(TEST_TIMEOUT, stream.next_batch()).await?;
    match second {
        Some(Err(Error::Backpressure { .. })) => {}
        other => panic!("expected Backpressure, got: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn inactivity_drops_the_socket_and_exhausts_the_retry_budget() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    client
        .create_session(CreateSessionRequest {
            id: Some(SessionId::from("s12")),
            ..CreateSessionRequest::default()
        })
        .await?;

    // a quiet session: every socket times out, so the backoff budget is
    // never restored and the retry limit must surface
    let mut options = fast_tail_options();
    options.inactivity_timeout = Some(Duration::from_millis(100));
    options.reconnect_policy.max_attempts = Some(2);
    let (options, recorder) = recording_options(options);
    let mut stream = client.session("s12").tail(options)?;

    let item = tokio::time::timeout(TEST_TIMEOUT, stream.next_batch()).await?;
    match item {
        Some(Err(Error::Tail { .. })) => {}
        other => panic!("expected a retry-limit tail error, got: {other:?}"),
    }
    assert!(recorder.lock().iter().any(|event| matches!(
        event,
        TailLifecycleEvent::StreamDropped {
            close_code: Some(4000),
            ..
        }
    )));
    Ok(())
}

#[tokio::test]
async fn list_sessions_filters_by_metadata() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    for (id, kind) in [("a1", "alpha"), ("a2", "alpha"), ("b1", "beta")] {
        client
            .create_session(CreateSessionRequest {
                id: Some(SessionId::from(id)),
                metadata: json!({ "kind": kind }).as_object().cloned(),
                ..CreateSessionRequest::default()
            })
            .await?;
    }

    let all = client.list_sessions(ListSessionsQuery::default()).await?;
    assert_eq!(all.sessions.len(), 3);

    let alphas = client
        .list_sessions(ListSessionsQuery {
            metadata: vec![("kind".to_owned(), "alpha".to_owned())],
            ..ListSessionsQuery::default()
        })
        .await?;
    let ids: Vec<&str> = alphas
        .sessions
        .iter()
        .map(|session| session.id.as_str())
        .collect();
    assert_eq!(ids, vec!["a1", "a2"]);

    let limited = client
        .list_sessions(ListSessionsQuery {
            limit: Some(1),
            ..ListSessionsQuery::default()
        })
        .await?;
    assert_eq!(limited.sessions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn list_sessions_pages_with_the_returned_cursor() -> eyre::Result<()> {
    let server = spawn_server().await?;
    let client = client_for(&server)?;
    for id in ["p1", "p2", "p3", "p4", "p5"] {
        client
            .create_session(CreateSessionRequest {
                id: Some(SessionId::from(id)),
                ..CreateSessionRequest::default()
            })
            .await?;
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = client
            .list_sessions(ListSessionsQuery {
                limit: Some(2),
                cursor: cursor.clone(),
                ..ListSessionsQuery::default()
            })
            .await?;
        assert!(page.sessions.len() <= 2, "page too large: {page:?}");
        seen.extend(
            page.sessions
                .iter()
                .map(|session| session.id.as_str().to_owned()),
        );
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, vec!["p1", "p2", "p3", "p4", "p5"]);
    Ok(())
}
