//! In-process Starcite server for tests.
//!
//! Serves the four HTTP endpoints and the websocket tail the SDK consumes,
//! backed by [`SessionStore`]. A [`FaultPlan`] lets tests break things on
//! purpose: dropping a tail socket without a closing handshake (forcing the
//! client to reconnect) or rejecting upcoming connects.

use std::sync::Arc;

use axum::extract::ws::{self, CloseFrame, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use starcite_types::api::v1::{
    AppendRequest, CreateSessionRequest, Event, IssueSessionTokenRequest,
    IssueSessionTokenResponse,
};
use starcite_types::api::close_codes;
use starcite_types::{Seq, SessionId};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::store::{SessionStore, StoreError};

/// Fault injection knobs of the test server.
#[derive(Clone, Default)]
pub struct FaultPlan {
    inner: Arc<Mutex<FaultState>>,
}

#[derive(Default)]
struct FaultState {
    drop_tail_after: Option<usize>,
    expire_mid_stream_after: Option<usize>,
    reject_connects: usize,
    tokens_expired: bool,
}

impl FaultPlan {
    /// Makes the next tail connection drop abruptly (no closing handshake)
    /// after sending `events` events.
    pub fn drop_tail_after(&self, events: usize) {
        self.inner.lock().drop_tail_after = Some(events);
    }

    /// Rejects the next `n` tail upgrades with a server error.
    pub fn reject_next_connects(&self, n: usize) {
        self.inner.lock().reject_connects = n;
    }

    /// Makes every subsequent tail upgrade fail with `token_expired`.
    pub fn expire_tokens(&self) {
        self.inner.lock().tokens_expired = true;
    }

    /// Makes the next tail connection close with the auth close code and
    /// reason `token_expired` after sending `events` events — what a server
    /// does when the presented session token ages out mid-stream.
    pub fn expire_mid_stream(&self, events: usize) {
        self.inner.lock().expire_mid_stream_after = Some(events);
    }

    fn take_drop_budget(&self) -> Option<usize> {
        self.inner.lock().drop_tail_after.take()
    }

    fn take_expiry_budget(&self) -> Option<usize> {
        self.inner.lock().expire_mid_stream_after.take()
    }

    fn tokens_expired(&self) -> bool {
        self.inner.lock().tokens_expired
    }

    fn should_reject_connect(&self) -> bool {
        let mut state = self.inner.lock();
        if state.reject_connects > 0 {
            state.reject_connects -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
struct AppState {
    store: SessionStore,
    faults: FaultPlan,
    api_key: Option<String>,
    tokens: Arc<Mutex<Vec<String>>>,
}

impl AppState {
    fn authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let Some(api_key) = &self.api_key else {
            return true;
        };
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .or(query_token);
        match presented {
            Some(token) => token == api_key || self.tokens.lock().iter().any(|t| t == token),
            None => false,
        }
    }
}

/// Builds the router of a test server.
pub fn starcite_router(store: SessionStore, faults: FaultPlan, api_key: Option<String>) -> Router {
    let state = AppState {
        store,
        faults,
        api_key,
        tokens: Arc::new(Mutex::new(Vec::new())),
    };
    Router::new()
        .route("/health", get(|| async { "healthy" }))
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/{id}/append", post(append))
        .route("/v1/auth/session-tokens", post(issue_session_token))
        .route("/v1/sessions/{id}/tail", any(tail))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    if !state.authorized(&headers, None) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    match state.store.create(request) {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => error_response(StatusCode::CONFLICT, err.code()),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if !state.authorized(&headers, None) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let mut limit = None;
    let mut cursor = None;
    let mut metadata = Vec::new();
    for (key, value) in parse_query(query.as_deref().unwrap_or_default()) {
        if key == "limit" {
            limit = value.parse::<usize>().ok();
        } else if key == "cursor" {
            cursor = Some(value);
        } else if let Some(meta_key) = key.strip_prefix("metadata.") {
            metadata.push((meta_key.to_owned(), value));
        }
    }
    let (sessions, next_cursor) = state.store.list(limit, cursor.as_deref(), &metadata);
    Json(json!({ "sessions": sessions, "next_cursor": next_cursor })).into_response()
}

async fn append(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<AppendRequest>,
) -> Response {
    if !state.authorized(&headers, None) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    match state.store.append(&SessionId::from(id.as_str()), request) {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(err @ StoreError::SessionNotFound) => {
            error_response(StatusCode::NOT_FOUND, err.code())
        }
        Err(err @ StoreError::SeqConflict { .. }) => {
            error_response(StatusCode::CONFLICT, err.code())
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.code()),
    }
}

async fn issue_session_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IssueSessionTokenRequest>,
) -> Response {
    if !state.authorized(&headers, None) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let token = format!("tok_{}", uuid::Uuid::new_v4());
    state.tokens.lock().push(token.clone());
    Json(IssueSessionTokenResponse {
        token,
        expires_in: request.ttl_seconds.unwrap_or(3600),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    #[serde(default)]
    cursor: u64,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    agent: Option<String>,
    follow: Option<String>,
    access_token: Option<String>,
}

fn default_batch_size() -> usize {
    256
}

async fn tail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.faults.tokens_expired() {
        return error_response(StatusCode::UNAUTHORIZED, "token_expired");
    }
    if !state.authorized(&headers, query.access_token.as_deref()) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    if state.faults.should_reject_connect() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "injected_fault");
    }
    let session = SessionId::from(id.as_str());
    ws.on_failed_upgrade(|err| {
        tracing::warn!("could not establish websocket connection: {err:?}");
    })
    .on_upgrade(move |socket| tail_socket(socket, state, session, query))
}

/// The life of one tail connection: replay the backlog in batch-sized array
/// frames, then either close gracefully (`follow=0`) or forward live events
/// until the client goes away.
async fn tail_socket(mut socket: WebSocket, state: AppState, session: SessionId, query: TailQuery) {
    let follow = query.follow.as_deref() != Some("0");
    let agent_actor = query.agent.as_ref().map(|agent| format!("agent:{agent}"));
    let mut drop_budget = state.faults.take_drop_budget();
    let mut expiry_budget = state.faults.take_expiry_budget();

    let (backlog, mut live) = match state.store.tail_from(&session, Seq::new(query.cursor)) {
        Ok(result) => result,
        Err(err) => {
            let _ = socket
                .send(ws::Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: err.code().into(),
                })))
                .await;
            return;
        }
    };

    let backlog: Vec<Event> = match &agent_actor {
        Some(actor) => backlog
            .into_iter()
            .filter(|event| event.actor == *actor)
            .collect(),
        None => backlog,
    };
    for chunk in backlog.chunks(query.batch_size.max(1)) {
        let frame = serde_json::to_string(chunk).expect("events serialize");
        if socket.send(ws::Message::Text(frame.into())).await.is_err() {
            return;
        }
        if consume_budget(&mut drop_budget, chunk.len()) {
            // drop without a closing handshake
            return;
        }
        if consume_budget(&mut expiry_budget, chunk.len()) {
            expire_socket(socket).await;
            return;
        }
    }

    if !follow {
        let _ = socket
            .send(ws::Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "caught up".into(),
            })))
            .await;
        return;
    }

    loop {
        tokio::select! {
            event = live.recv() => match event {
                Ok(event) => {
                    if let Some(actor) = &agent_actor
                        && event.actor != *actor
                    {
                        continue;
                    }
                    let frame = serde_json::to_string(&event).expect("event serializes");
                    if socket.send(ws::Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                    if consume_budget(&mut drop_budget, 1) {
                        return;
                    }
                    if consume_budget(&mut expiry_budget, 1) {
                        expire_socket(socket).await;
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("tail of {session} lagged by {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = socket
                        .send(ws::Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "shutdown".into(),
                        })))
                        .await;
                    return;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Closes a live socket the way a server ends a tail whose session token
/// aged out.
async fn expire_socket(mut socket: WebSocket) {
    let _ = socket
        .send(ws::Message::Close(Some(CloseFrame {
            code: close_codes::AUTH,
            reason: "token_expired".into(),
        })))
        .await;
}

/// Decrements the fault budget by `sent` and reports whether it is used up.
fn consume_budget(budget: &mut Option<usize>, sent: usize) -> bool {
    match budget {
        Some(remaining) => {
            *remaining = remaining.saturating_sub(sent);
            *remaining == 0
        }
        None => false,
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// A running in-process Starcite server.
pub struct TestServerHandle {
    /// HTTP base URL (no `/v1` suffix).
    pub base_url: String,
    /// The server's state, for seeding and assertions.
    pub store: SessionStore,
    /// Fault injection knobs.
    pub faults: FaultPlan,
    shutdown: CancellationToken,
}

impl TestServerHandle {
    /// Stops the server.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spawns a server without authentication on an ephemeral port.
pub async fn spawn_server() -> eyre::Result<TestServerHandle> {
    spawn_server_with_api_key(None).await
}

/// Spawns a server requiring the given API key (or a token minted from it).
pub async fn spawn_server_with_api_key(
    api_key: Option<String>,
) -> eyre::Result<TestServerHandle> {
    let store = SessionStore::new();
    let faults = FaultPlan::default();
    let router = starcite_router(store.clone(), faults.clone(), api_key);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(err) = result {
            tracing::error!("test server failed: {err}");
        }
    });
    Ok(TestServerHandle {
        base_url: format!("http://{addr}"),
        store,
        faults,
        shutdown,
    })
}
