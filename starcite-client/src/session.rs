//! One session: appends, tails, durable consumption and live subscriptions.
//!
//! A [`Session`] owns the producer identity for its appends, the canonical
//! [`SessionLog`] behind live subscriptions, and the background sync task
//! that feeds it. Handles are cheap to clone and share their state, so a
//! session obtained twice from the same client keeps one producer sequence.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use secrecy::ExposeSecret as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use starcite_types::api::v1::{AppendRequest, AppendResponse, Event};
use starcite_types::{ProducerSeq, Seq, SessionId};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::cursor::CursorStore;
use crate::error::{BoxError, Error};
use crate::http::HttpTransport;
use crate::log::{LogSubscription, SessionLog};
use crate::tail::{TailArgs, TailOptions, TailStream, WsAuth};

/// The client-local identity a session appends under.
///
/// The identity must be stable for the server's dedupe window to work: a
/// long-lived process (a CLI, a daemon) persists it and injects it back on
/// restart via [`crate::Client::session_with_identity`], so the producer
/// sequence continues instead of starting over under a fresh id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProducerIdentity {
    /// Stable producer id, generated once per identity.
    pub producer_id: String,
    /// The actor appends are attributed to, by convention `user:<id>` or
    /// `agent:<name>`.
    pub actor: String,
    /// The last producer sequence this identity has used. `0` for a fresh
    /// identity; the next append uses `last_producer_seq + 1`.
    pub last_producer_seq: u64,
}

impl ProducerIdentity {
    /// Generates a fresh identity with a random producer id.
    pub fn generate() -> Self {
        let id = Uuid::new_v4();
        Self {
            producer_id: format!("producer:{id}"),
            actor: format!("user:{id}"),
            last_producer_seq: 0,
        }
    }

    /// Generates a fresh identity appending as the given actor.
    pub fn generate_for_actor(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Self::generate()
        }
    }
}

/// Input of [`Session::append`]. Requires `text` or `payload`.
#[derive(Clone, Debug, Default)]
pub struct AppendInput {
    /// Convenience text payload; becomes `{"text": …}` when no payload is
    /// given.
    pub text: Option<String>,
    /// Full event payload. Wins over `text`.
    pub payload: Option<Map<String, Value>>,
    /// Event type, default `content`.
    pub event_type: Option<String>,
    /// Overrides the identity's actor for this append.
    pub actor: Option<String>,
    /// Origin hint, default `agent`.
    pub source: Option<String>,
    /// Arbitrary metadata attached to the event.
    pub metadata: Option<Map<String, Value>>,
    /// References to other events or external entities.
    pub refs: Option<Map<String, Value>>,
    /// Optimistic concurrency precondition on the session head.
    pub expected_seq: Option<Seq>,
    /// Idempotency key for server-side retry deduplication.
    pub idempotency_key: Option<String>,
}

impl AppendInput {
    /// An append of a plain text event.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// An append of a structured payload.
    pub fn payload(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            payload: Some(payload),
            ..Self::default()
        }
    }
}

/// Options of [`Session::consume`].
pub struct ConsumeOptions {
    /// Explicit starting cursor. Falls back to the stored cursor, then 0.
    pub cursor: Option<Seq>,
    /// Checkpoint store consulted at start and after every handled event.
    pub cursor_store: Arc<dyn CursorStore>,
    /// Tail settings for the underlying stream.
    pub tail: TailOptions,
}

struct LiveState {
    subscribers: AtomicUsize,
    cancel: CancellationToken,
}

pub(crate) struct SessionInner {
    id: SessionId,
    transport: Arc<HttpTransport>,
    ws_auth: WsAuth,
    identity: ProducerIdentity,
    producer_seq: AtomicU64,
    log: SessionLog,
    live: Mutex<Option<Arc<LiveState>>>,
}

/// One Starcite session, bound to the client it came from.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        transport: Arc<HttpTransport>,
        ws_auth: WsAuth,
        identity: ProducerIdentity,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                transport,
                ws_auth,
                producer_seq: AtomicU64::new(identity.last_producer_seq),
                identity,
                log: SessionLog::new(),
                live: Mutex::new(None),
            }),
        }
    }

    /// The session id.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// The canonical in-memory log behind live subscriptions.
    pub fn log(&self) -> &SessionLog {
        &self.inner.log
    }

    /// A snapshot of the producer identity including the current producer
    /// sequence, suitable for persisting across restarts.
    pub fn identity(&self) -> ProducerIdentity {
        ProducerIdentity {
            last_producer_seq: self.inner.producer_seq.load(Ordering::Acquire),
            ..self.inner.identity.clone()
        }
    }

    /// Appends one event to the session.
    ///
    /// The producer sequence is taken before the request goes out and is
    /// never rolled back: the server is the source of truth and dedupes a
    /// retry of the same `(producer_id, producer_seq)`, so a caller retrying
    /// a failed append is safe.
    ///
    /// # Errors
    /// [`Error::Config`] when neither `text` nor `payload` is supplied;
    /// server rejections surface as [`Error::Api`] and are not retried here.
    #[instrument(level = "debug", skip_all, fields(session = %self.inner.id))]
    pub async fn append(&self, input: AppendInput) -> Result<AppendResponse, Error> {
        let request = self.build_append_request(input)?;
        tracing::trace!(
            "> appending producer_seq {} to {}",
            request.producer_seq,
            self.inner.id
        );
        self.inner
            .transport
            .post(&format!("/sessions/{}/append", self.inner.id), &request)
            .await
    }

    /// Like [`Session::append`], but gives up early when `cancel` fires.
    /// An append already in flight is not rolled back by the server.
    pub async fn append_with_cancel(
        &self,
        input: AppendInput,
        cancel: &CancellationToken,
    ) -> Result<AppendResponse, Error> {
        let request = self.build_append_request(input)?;
        self.inner
            .transport
            .post_with_cancel(
                &format!("/sessions/{}/append", self.inner.id),
                &request,
                cancel,
            )
            .await
    }

    fn build_append_request(&self, input: AppendInput) -> Result<AppendRequest, Error> {
        if input.text.is_none() && input.payload.is_none() {
            return Err(Error::Config(
                "append requires text or payload".to_owned(),
            ));
        }
        let producer_seq = self.inner.producer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = match (input.payload, input.text) {
            (Some(payload), _) => payload,
            (None, Some(text)) => {
                let mut payload = Map::new();
                payload.insert("text".to_owned(), Value::String(text));
                payload
            }
            (None, None) => unreachable!("validated above"),
        };
        Ok(AppendRequest {
            event_type: input.event_type.unwrap_or_else(|| "content".to_owned()),
            payload,
            actor: input
                .actor
                .unwrap_or_else(|| self.inner.identity.actor.clone()),
            producer_id: self.inner.identity.producer_id.clone(),
            producer_seq: ProducerSeq::new(producer_seq),
            source: input.source.or_else(|| Some("agent".to_owned())),
            metadata: input.metadata,
            refs: input.refs,
            expected_seq: input.expected_seq,
            idempotency_key: input.idempotency_key,
        })
    }

    /// Opens a tail stream of this session.
    pub fn tail(&self, options: TailOptions) -> Result<TailStream, Error> {
        TailStream::open(self.tail_args(), options)
    }

    fn tail_args(&self) -> TailArgs {
        TailArgs {
            ws_base: self.inner.transport.ws_base_url(),
            session: self.inner.id.clone(),
            bearer: self
                .inner
                .transport
                .bearer()
                .map(|token| token.expose_secret().to_owned()),
            auth: self.inner.ws_auth,
        }
    }

    /// Consumes the session with durable checkpointing.
    ///
    /// For every event the handler runs first, then the cursor store saves
    /// the event's sequence. A failure of either terminates the stream
    /// without advancing the checkpoint, so a restarted consume redelivers
    /// from the last handled event — at-least-once, converging to
    /// exactly-once when the handler is idempotent.
    #[instrument(level = "debug", skip_all, fields(session = %self.inner.id))]
    pub async fn consume<F, Fut>(
        &self,
        options: ConsumeOptions,
        mut handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(Event) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let id = &self.inner.id;
        let stored = match options.cursor {
            Some(cursor) => Some(cursor),
            None => options
                .cursor_store
                .load(id)
                .await
                .map_err(|source| Error::CursorStore {
                    session: id.clone(),
                    source,
                })?,
        };
        let cursor = stored.unwrap_or(Seq::ZERO);
        tracing::debug!("consuming {id} from cursor {cursor}");
        let mut stream = self.tail(TailOptions {
            cursor,
            ..options.tail
        })?;
        while let Some(item) = stream.next_event().await {
            let event = item?;
            let seq = event.seq;
            handler(event).await.map_err(|source| Error::Handler {
                session: id.clone(),
                seq,
                source,
            })?;
            options
                .cursor_store
                .save(id, seq)
                .await
                .map_err(|source| Error::CursorStore {
                    session: id.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Subscribes to the session's canonical log and lazily starts the
    /// shared background tail that feeds it.
    ///
    /// With `replay`, the retained events are queued on the subscription
    /// before this call returns. All subscriptions share one tail; when the
    /// last one is dropped, the tail is aborted.
    pub fn subscribe(&self, replay: bool) -> SessionSubscription {
        let subscription = self.inner.log.subscribe(replay);
        let state = self.ensure_live_sync();
        SessionSubscription {
            subscription,
            state,
            session: Arc::clone(&self.inner),
        }
    }

    fn ensure_live_sync(&self) -> Arc<LiveState> {
        let mut live = self.inner.live.lock();
        if let Some(state) = live.as_ref()
            && !state.cancel.is_cancelled()
        {
            state.subscribers.fetch_add(1, Ordering::SeqCst);
            return Arc::clone(state);
        }
        let state = Arc::new(LiveState {
            subscribers: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
        });
        *live = Some(Arc::clone(&state));
        tokio::spawn(live_sync(
            Arc::clone(&self.inner),
            state.cancel.clone(),
        ));
        state
    }
}

/// A subscription to a session's live event feed.
///
/// Dropping the subscription unsubscribes; the last drop aborts the shared
/// background tail.
pub struct SessionSubscription {
    subscription: LogSubscription,
    state: Arc<LiveState>,
    session: Arc<SessionInner>,
}

impl SessionSubscription {
    /// The next event, in log order.
    pub async fn next(&mut self) -> Option<Event> {
        self.subscription.next().await
    }

    /// Non-blocking variant of [`SessionSubscription::next`].
    pub fn try_next(&mut self) -> Option<Event> {
        self.subscription.try_next()
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if self.state.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.cancel.cancel();
            let mut live = self.session.live.lock();
            if let Some(current) = live.as_ref()
                && Arc::ptr_eq(current, &self.state)
            {
                *live = None;
            }
        }
    }
}

/// Feeds the session log from a tail, reconnecting from the log head
/// whenever the log reports a gap.
#[instrument(level = "debug", skip_all, fields(session = %inner.id))]
async fn live_sync(inner: Arc<SessionInner>, cancel: CancellationToken) {
    inner.log.set_syncing(true);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let cursor = inner.log.last_seq();
        let opened = TailStream::open(
            TailArgs {
                ws_base: inner.transport.ws_base_url(),
                session: inner.id.clone(),
                bearer: inner
                    .transport
                    .bearer()
                    .map(|token| token.expose_secret().to_owned()),
                auth: inner.ws_auth,
            },
            TailOptions {
                cursor,
                cancel: Some(cancel.child_token()),
                ..TailOptions::default()
            },
        );
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!("could not open live sync tail for {}: {err}", inner.id);
                break;
            }
        };
        let mut terminal_failure = false;
        while let Some(item) = stream.next_batch().await {
            match item {
                Ok(batch) => {
                    if let Err(err) = inner.log.apply_batch(&batch) {
                        // a hole means we missed events; reconnect from the
                        // head and let the server backfill
                        tracing::debug!("resyncing {} from {}: {err}", inner.id, cursor);
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("live sync of {} failed: {err}", inner.id);
                    terminal_failure = true;
                    break;
                }
            }
        }
        if terminal_failure || cancel.is_cancelled() {
            break;
        }
        // gap or server-side close: reopen from the current head
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }
    inner.log.set_syncing(false);
}
