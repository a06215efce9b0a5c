//! Resume-safe tail streams.
//!
//! A [`TailStream`] wraps a managed websocket and turns its frames into an
//! ordered sequence of event batches. The stream tracks the highest sequence
//! it has forwarded; every (re)connect renders that cursor into the tail URL,
//! so the server resumes strictly after the last delivered event and a
//! reconnect never loses or duplicates data from the consumer's point of
//! view.
//!
//! A background pump task drives the socket and fills a bounded batch buffer.
//! When the consumer cannot keep up and the buffer would overflow, the
//! stream fails with [`Error::Backpressure`] instead of buffering without
//! bound, which would break the resume guarantee.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use starcite_types::api::v1::Event;
use starcite_types::{Seq, SessionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use crate::error::{Error, TailStage};
use crate::frame::parse_frame;
use crate::ws::{ManagedSocket, ManagedSocketArgs, ReconnectPolicy, SocketEvent};

/// How the tail credential travels to the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WsAuth {
    /// `Authorization: Bearer …` request header. The native default.
    #[default]
    Header,
    /// `access_token` query parameter, for servers or proxies that only read
    /// the URL (the browser-runtime transport mode).
    QueryParam,
}

/// The reason a tail stream ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The cancellation token fired.
    Aborted,
    /// A non-following tail drained the stored events.
    CaughtUp,
    /// The server closed the stream gracefully.
    Graceful,
}

/// User-visible lifecycle events of a tail stream.
#[derive(Clone, Debug)]
pub enum TailLifecycleEvent {
    /// A connection attempt is starting.
    ConnectAttempt {
        /// 1-based attempt counter.
        attempt: u32,
    },
    /// A reconnect was scheduled after a drop.
    ReconnectScheduled {
        /// The upcoming attempt.
        attempt: u32,
        /// The backoff delay before it starts.
        delay: Duration,
        /// Close code of the dropped socket, if any.
        close_code: Option<u16>,
        /// Close reason of the dropped socket, if any.
        close_reason: Option<String>,
    },
    /// The current socket dropped.
    StreamDropped {
        /// The attempt that dropped.
        attempt: u32,
        /// Close code, if the peer sent one.
        close_code: Option<u16>,
        /// Close reason, if the peer sent one.
        close_reason: Option<String>,
    },
    /// The stream is over.
    StreamEnded {
        /// Why it ended.
        reason: StreamEndReason,
    },
}

/// Callback receiving [`TailLifecycleEvent`]s as the stream progresses.
pub type LifecycleCallback = Arc<dyn Fn(&TailLifecycleEvent) + Send + Sync>;

/// Options of a tail stream.
#[derive(Clone)]
pub struct TailOptions {
    /// Exclusive lower bound: deliver events with `seq > cursor`.
    pub cursor: Seq,
    /// Events per frame the server may batch, 1..=1000.
    pub batch_size: usize,
    /// Only yield events of this agent (`actor == "agent:<name>"`). Filtered
    /// events still advance the cursor.
    pub agent: Option<String>,
    /// Stay live after catching up. `false` performs a catch-up-only read.
    pub follow: bool,
    /// Close a non-following stream when no frame arrives within this
    /// window. Guards servers that do not close on their own.
    pub catch_up_idle: Duration,
    /// Reconnect on drops.
    pub reconnect: bool,
    /// Backoff settings for reconnects.
    pub reconnect_policy: ReconnectPolicy,
    /// Bound of the batch buffer between the socket and the consumer.
    pub max_buffered_batches: usize,
    /// Time budget for the websocket opening handshake.
    pub connect_timeout: Duration,
    /// Drop a socket when no frame arrives within this window.
    pub inactivity_timeout: Option<Duration>,
    /// Overrides the client's credential transport for this stream.
    pub ws_auth: Option<WsAuth>,
    /// Observer for lifecycle events.
    pub on_lifecycle: Option<LifecycleCallback>,
    /// Aborts the stream when cancelled. A fresh token is created when
    /// absent.
    pub cancel: Option<CancellationToken>,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            cursor: Seq::ZERO,
            batch_size: 256,
            agent: None,
            follow: true,
            catch_up_idle: Duration::from_millis(1000),
            reconnect: true,
            reconnect_policy: ReconnectPolicy::default(),
            max_buffered_batches: 1024,
            connect_timeout: Duration::from_millis(4000),
            inactivity_timeout: None,
            ws_auth: None,
            on_lifecycle: None,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for TailOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailOptions")
            .field("cursor", &self.cursor)
            .field("batch_size", &self.batch_size)
            .field("agent", &self.agent)
            .field("follow", &self.follow)
            .field("reconnect", &self.reconnect)
            .field("max_buffered_batches", &self.max_buffered_batches)
            .finish()
    }
}

pub(crate) struct TailArgs {
    pub(crate) ws_base: String,
    pub(crate) session: SessionId,
    /// Exposed bearer credential, if the transport holds one.
    pub(crate) bearer: Option<String>,
    /// The client's default credential transport.
    pub(crate) auth: WsAuth,
}

/// An open tail stream of one session.
///
/// Dropping the stream aborts the underlying connection.
#[derive(Debug)]
pub struct TailStream {
    session: SessionId,
    rx: mpsc::Receiver<Vec<Event>>,
    failure: Arc<Mutex<Option<Error>>>,
    cursor: Arc<AtomicU64>,
    cancel: CancellationToken,
    flattened: VecDeque<Event>,
    done: bool,
}

impl TailStream {
    /// Validates the options, spawns the pump task and returns the stream.
    pub(crate) fn open(args: TailArgs, options: TailOptions) -> Result<TailStream, Error> {
        if options.batch_size == 0 || options.batch_size > 1000 {
            return Err(Error::Config(format!(
                "batch_size must be within 1..=1000, got {}",
                options.batch_size
            )));
        }
        if options.max_buffered_batches == 0 {
            return Err(Error::Config(
                "max_buffered_batches must be at least 1".to_owned(),
            ));
        }
        let base = Url::parse(&args.ws_base)
            .map_err(|err| Error::Config(format!("invalid websocket base url: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "invalid websocket base url: {}",
                args.ws_base
            )));
        }

        let cursor = Arc::new(AtomicU64::new(options.cursor.into_inner()));
        let cancel = options.cancel.clone().unwrap_or_default();
        let (header_bearer, query_token) = match options.ws_auth.unwrap_or(args.auth) {
            WsAuth::Header => (args.bearer.clone(), None),
            WsAuth::QueryParam => (None, args.bearer.clone()),
        };

        let url = {
            let cursor = Arc::clone(&cursor);
            let session = args.session.clone();
            let batch_size = options.batch_size;
            let agent = options.agent.clone();
            let follow = options.follow;
            move || {
                let mut url = base.clone();
                url.path_segments_mut()
                    .expect("base url accepts path segments")
                    .push("sessions")
                    .push(session.as_str())
                    .push("tail");
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs.append_pair("cursor", &cursor.load(Ordering::Acquire).to_string());
                    pairs.append_pair("batch_size", &batch_size.to_string());
                    if let Some(agent) = &agent {
                        pairs.append_pair("agent", agent);
                    }
                    if !follow {
                        pairs.append_pair("follow", "0");
                    }
                    if let Some(token) = &query_token {
                        pairs.append_pair("access_token", token);
                    }
                }
                url.to_string()
            }
        };

        let socket = ManagedSocket::new(ManagedSocketArgs {
            url,
            bearer: header_bearer,
            reconnect: options.reconnect,
            policy: options.reconnect_policy.clone(),
            connect_timeout: options.connect_timeout,
            inactivity_timeout: options.inactivity_timeout,
            cancel: cancel.clone(),
        });

        let (tx, rx) = mpsc::channel(options.max_buffered_batches);
        let failure = Arc::new(Mutex::new(None));
        tokio::spawn(pump(PumpArgs {
            socket,
            tx,
            failure: Arc::clone(&failure),
            cursor: Arc::clone(&cursor),
            session: args.session.clone(),
            agent_actor: options.agent.as_ref().map(|agent| format!("agent:{agent}")),
            follow: options.follow,
            catch_up_idle: options.catch_up_idle,
            max_buffered_batches: options.max_buffered_batches,
            on_lifecycle: options.on_lifecycle.clone(),
        }));

        Ok(TailStream {
            session: args.session,
            rx,
            failure,
            cursor,
            cancel,
            flattened: VecDeque::new(),
            done: false,
        })
    }

    /// The session this stream tails.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// The highest sequence forwarded so far (or the initial cursor).
    pub fn cursor(&self) -> Seq {
        Seq::new(self.cursor.load(Ordering::Acquire))
    }

    /// Requests the stream to stop. Idempotent.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Pulls the next batch. `None` means the stream ended; a terminal error
    /// is yielded exactly once before that.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<Event>, Error>> {
        if !self.flattened.is_empty() {
            // drain events a next_event caller left behind
            let drained: Vec<Event> = self.flattened.drain(..).collect();
            return Some(Ok(drained));
        }
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(batch) => Some(Ok(batch)),
            None => {
                self.done = true;
                self.failure.lock().take().map(Err)
            }
        }
    }

    /// Pulls the next single event. `None` means the stream ended; a
    /// terminal error is yielded exactly once before that.
    pub async fn next_event(&mut self) -> Option<Result<Event, Error>> {
        loop {
            if let Some(event) = self.flattened.pop_front() {
                return Some(Ok(event));
            }
            match self.next_batch().await? {
                Ok(batch) => self.flattened.extend(batch),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl Drop for TailStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PumpArgs<U> {
    socket: ManagedSocket<U>,
    tx: mpsc::Sender<Vec<Event>>,
    failure: Arc<Mutex<Option<Error>>>,
    cursor: Arc<AtomicU64>,
    session: SessionId,
    agent_actor: Option<String>,
    follow: bool,
    catch_up_idle: Duration,
    max_buffered_batches: usize,
    on_lifecycle: Option<LifecycleCallback>,
}

/// Drives the managed socket until the stream is over, filling the batch
/// buffer and the failure slot.
#[instrument(level = "debug", skip_all, fields(session = %args.session))]
async fn pump<U: Fn() -> String>(mut args: PumpArgs<U>) {
    let emit = |event: TailLifecycleEvent| {
        if let Some(callback) = &args.on_lifecycle {
            callback(&event);
        }
    };
    // reset the backoff budget once per socket, on its first useful frame
    let mut socket_delivered = false;

    loop {
        let event = if !args.follow && args.socket.is_live() {
            match tokio::time::timeout(args.catch_up_idle, args.socket.next_event()).await {
                Ok(event) => event,
                Err(_) => {
                    tracing::debug!("caught up: no frame within {:?}", args.catch_up_idle);
                    args.socket
                        .close(u16::from(CloseCode::Normal), "caught up")
                        .await;
                    emit(TailLifecycleEvent::StreamEnded {
                        reason: StreamEndReason::CaughtUp,
                    });
                    break;
                }
            }
        } else {
            args.socket.next_event().await
        };

        match event {
            SocketEvent::ConnectAttempt { attempt } => {
                emit(TailLifecycleEvent::ConnectAttempt { attempt });
            }
            SocketEvent::ConnectFailed { attempt, message } => {
                tracing::debug!("tail connect attempt {attempt} failed: {message}");
            }
            SocketEvent::Open { attempt } => {
                tracing::trace!("tail socket open (attempt {attempt})");
                socket_delivered = false;
            }
            SocketEvent::Frame(text) => {
                let events = match parse_frame(&text) {
                    Ok(events) => events,
                    Err(err) => {
                        tracing::warn!("tail frame rejected: {err}");
                        args.socket
                            .close(u16::from(CloseCode::Protocol), "invalid frame")
                            .await;
                        record_failure(&args.failure, err);
                        break;
                    }
                };
                if !socket_delivered {
                    socket_delivered = true;
                    args.socket.reset_attempts();
                }
                let current = args.cursor.load(Ordering::Acquire);
                let batch_head = events
                    .iter()
                    .map(|event| event.seq.into_inner())
                    .max()
                    .unwrap_or(current);
                let fresh: Vec<Event> = events
                    .into_iter()
                    .filter(|event| event.seq.into_inner() > current)
                    .filter(|event| match &args.agent_actor {
                        Some(actor) => event.actor == *actor,
                        None => true,
                    })
                    .collect();
                if !fresh.is_empty() {
                    match args.tx.try_send(fresh) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            args.socket
                                .close(u16::from(CloseCode::Policy), "backpressure")
                                .await;
                            record_failure(
                                &args.failure,
                                Error::Backpressure {
                                    session: args.session.clone(),
                                    max_buffered_batches: args.max_buffered_batches,
                                },
                            );
                            break;
                        }
                        Err(TrySendError::Closed(_)) => {
                            // consumer is gone
                            args.socket
                                .close(u16::from(CloseCode::Normal), "consumer dropped")
                                .await;
                            break;
                        }
                    }
                }
                if batch_head > current {
                    args.cursor.store(batch_head, Ordering::Release);
                }
            }
            SocketEvent::Dropped {
                attempt,
                close_code,
                close_reason,
            } => {
                emit(TailLifecycleEvent::StreamDropped {
                    attempt,
                    close_code,
                    close_reason,
                });
            }
            SocketEvent::ReconnectScheduled {
                attempt,
                delay,
                close_code,
                close_reason,
            } => {
                emit(TailLifecycleEvent::ReconnectScheduled {
                    attempt,
                    delay,
                    close_code,
                    close_reason,
                });
            }
            SocketEvent::RetryLimit { attempts } => {
                record_failure(
                    &args.failure,
                    Error::Tail {
                        session: args.session.clone(),
                        stage: TailStage::Reconnect,
                        message: format!("retry limit reached after {attempts} attempts"),
                    },
                );
            }
            SocketEvent::AuthRejected { reason } => {
                let error = if reason.contains("token_expired") {
                    Error::TokenExpired
                } else {
                    Error::Tail {
                        session: args.session.clone(),
                        stage: TailStage::Connect,
                        message: format!("credential rejected: {reason}"),
                    }
                };
                record_failure(&args.failure, error);
            }
            SocketEvent::Closed {
                close_code,
                close_reason,
                aborted,
                graceful,
            } => {
                if aborted {
                    emit(TailLifecycleEvent::StreamEnded {
                        reason: StreamEndReason::Aborted,
                    });
                } else if graceful {
                    let reason = if args.follow {
                        StreamEndReason::Graceful
                    } else {
                        StreamEndReason::CaughtUp
                    };
                    emit(TailLifecycleEvent::StreamEnded { reason });
                } else {
                    // non-graceful terminal without a recorded failure means
                    // the drop was not retryable (reconnect disabled)
                    record_failure(
                        &args.failure,
                        Error::Tail {
                            session: args.session.clone(),
                            stage: TailStage::Reconnect,
                            message: format!(
                                "connection dropped (code {close_code:?}, reason {close_reason:?}) and reconnect is disabled"
                            ),
                        },
                    );
                }
                break;
            }
        }
    }
}

/// Records the stream's terminal error. The first failure wins.
fn record_failure(slot: &Mutex<Option<Error>>, error: Error) {
    slot.lock().get_or_insert(error);
}
