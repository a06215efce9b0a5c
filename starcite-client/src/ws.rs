//! Managed websocket connection for tail streams.
//!
//! A [`ManagedSocket`] owns one *logical* connection across potentially many
//! physical sockets. The caller pulls [`SocketEvent`]s out of it; the socket
//! handles connecting (with a handshake timeout), watching for inactivity,
//! classifying closes, and scheduling reconnects with exponential backoff.
//!
//! The connection URL is a thunk that is re-evaluated on every attempt, so a
//! reconnect always carries the caller's latest cursor without this module
//! knowing what a cursor is.
//!
//! Close classification is timing-independent: an `Err` item from the
//! underlying stream marks the connection dropped no matter what close frame
//! follows, and a clean close with code 1000 is graceful. Closing handshakes
//! we initiate ourselves are best-effort, matching the server's own
//! behavior.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt as _;
use rand::Rng as _;
use starcite_types::api::close_codes;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self, ClientRequestBuilder,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential backoff settings for tail reconnects.
///
/// The delay before attempt `n + 1` (after `n` completed attempts) is
/// `min(max_delay, initial_delay * multiplier^(n-1))`, multiplied by a
/// uniform sample from `[1 - jitter_ratio, 1 + jitter_ratio]` when jitter is
/// enabled.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound for the computed delay, before jitter.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter as a ratio of the computed delay. `0.0` disables jitter.
    pub jitter_ratio: f64,
    /// Give up after this many connection attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(15_000),
            multiplier: 2.0,
            jitter_ratio: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// The backoff delay after `completed_attempts` connection attempts.
    pub(crate) fn delay(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter_ratio > 0.0 {
            let factor = rand::thread_rng()
                .gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// One lifecycle event of the managed connection.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// A connection attempt is starting.
    ConnectAttempt { attempt: u32 },
    /// The attempt failed before the socket opened.
    ConnectFailed { attempt: u32, message: String },
    /// The socket finished its opening handshake.
    Open { attempt: u32 },
    /// A text frame arrived.
    Frame(String),
    /// The connection died without a graceful close.
    Dropped {
        attempt: u32,
        close_code: Option<u16>,
        close_reason: Option<String>,
    },
    /// A reconnect was scheduled after a drop or failed attempt.
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
        close_code: Option<u16>,
        close_reason: Option<String>,
    },
    /// The reconnect budget is exhausted. Terminal.
    RetryLimit { attempts: u32 },
    /// The peer rejected our credential. Terminal, never retried.
    AuthRejected { reason: String },
    /// The logical connection is over. Every later pull returns this again.
    Closed {
        close_code: Option<u16>,
        close_reason: Option<String>,
        aborted: bool,
        graceful: bool,
    },
}

#[derive(Clone, Debug)]
struct ClosedInfo {
    close_code: Option<u16>,
    close_reason: Option<String>,
    aborted: bool,
    graceful: bool,
}

enum State {
    Idle,
    Backoff { delay: Duration },
    Connecting,
    Live { socket: Box<WebSocket> },
    Terminal(ClosedInfo),
}

pub(crate) struct ManagedSocketArgs<U> {
    /// Re-evaluated before every connection attempt.
    pub(crate) url: U,
    /// Bearer credential sent as an `Authorization` header. `None` when the
    /// URL itself carries the credential (query-parameter auth).
    pub(crate) bearer: Option<String>,
    pub(crate) reconnect: bool,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) connect_timeout: Duration,
    pub(crate) inactivity_timeout: Option<Duration>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct ManagedSocket<U> {
    url: U,
    bearer: Option<String>,
    reconnect: bool,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    inactivity_timeout: Option<Duration>,
    cancel: CancellationToken,
    state: State,
    attempt: u32,
    pending: VecDeque<SocketEvent>,
}

impl<U: Fn() -> String> ManagedSocket<U> {
    pub(crate) fn new(args: ManagedSocketArgs<U>) -> Self {
        Self {
            url: args.url,
            bearer: args.bearer,
            reconnect: args.reconnect,
            policy: args.policy,
            connect_timeout: args.connect_timeout,
            inactivity_timeout: args.inactivity_timeout,
            cancel: args.cancel,
            state: State::Idle,
            attempt: 0,
            pending: VecDeque::new(),
        }
    }

    /// Whether a physical socket is currently open.
    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, State::Live { .. })
    }

    /// Restores the backoff budget. Called by the tail stream once a socket
    /// delivered useful data, so only persistently failing peers consume the
    /// budget.
    pub(crate) fn reset_attempts(&mut self) {
        self.attempt = 1;
    }

    /// Closes the connection locally with the given code and ends the
    /// logical connection gracefully.
    pub(crate) async fn close(&mut self, code: u16, reason: &str) {
        let state = std::mem::replace(
            &mut self.state,
            State::Terminal(ClosedInfo {
                close_code: Some(code),
                close_reason: Some(reason.to_owned()),
                aborted: false,
                graceful: true,
            }),
        );
        match state {
            State::Live { socket } => {
                close_best_effort(*socket, CloseCode::from(code), reason).await;
            }
            // keep the original terminal info
            State::Terminal(info) => self.state = State::Terminal(info),
            _ => {}
        }
    }

    /// Advances the connection state machine and returns the next event.
    ///
    /// Once a `Closed` event was returned, every further call returns it
    /// again.
    pub(crate) async fn next_event(&mut self) -> SocketEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            if self.cancel.is_cancelled() {
                if let State::Terminal(_) = self.state {
                    // fall through to the terminal arm below
                } else {
                    return self.finish_aborted().await;
                }
            }
            if matches!(self.state, State::Live { .. }) {
                // the socket stays in place while we wait, so a caller that
                // drops this future mid-wait (catch-up idle) keeps a usable
                // connection
                let inactivity_timeout = self.inactivity_timeout;
                let outcome = {
                    let State::Live { socket } = &mut self.state else {
                        unreachable!("checked above")
                    };
                    let idle = async {
                        match inactivity_timeout {
                            Some(window) => tokio::time::sleep(window).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => LiveOutcome::Aborted,
                        _ = idle => LiveOutcome::Idle,
                        msg = socket.next() => LiveOutcome::Message(msg),
                    }
                };
                if let LiveOutcome::Message(Some(Ok(tungstenite::Message::Text(text)))) = &outcome
                {
                    return SocketEvent::Frame(text.as_str().to_owned());
                }
                if let LiveOutcome::Message(Some(Ok(
                    tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_),
                ))) = &outcome
                {
                    // tungstenite answers pings internally
                    continue;
                }
                let State::Live { socket } = std::mem::replace(
                    &mut self.state,
                    State::Terminal(ClosedInfo {
                        close_code: None,
                        close_reason: None,
                        aborted: false,
                        graceful: false,
                    }),
                ) else {
                    unreachable!("checked above")
                };
                match outcome {
                    LiveOutcome::Aborted => {
                        close_best_effort(*socket, CloseCode::Normal, "aborted").await;
                        return self.finish_aborted().await;
                    }
                    LiveOutcome::Idle => {
                        tracing::debug!(
                            "no tail frame within {:?}, dropping socket",
                            self.inactivity_timeout
                        );
                        let reason = "inactivity timeout".to_owned();
                        close_best_effort(
                            *socket,
                            CloseCode::from(close_codes::INACTIVITY),
                            &reason,
                        )
                        .await;
                        self.pending.push_back(SocketEvent::Dropped {
                            attempt: self.attempt,
                            close_code: Some(close_codes::INACTIVITY),
                            close_reason: Some(reason.clone()),
                        });
                        self.schedule_retry(Some(close_codes::INACTIVITY), Some(reason));
                    }
                    LiveOutcome::Message(Some(Ok(tungstenite::Message::Close(frame)))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (
                                Some(u16::from(frame.code)),
                                Some(frame.reason.as_str().to_owned()),
                            ),
                            None => (None, None),
                        };
                        tracing::trace!("did get close frame: {code:?} {reason:?}");
                        let mut socket = socket;
                        let _ = socket.close(None).await;
                        if code == Some(u16::from(CloseCode::Normal)) {
                            return self.finish_graceful(code, reason);
                        }
                        if code == Some(close_codes::AUTH) {
                            self.pending.push_back(SocketEvent::AuthRejected {
                                reason: reason
                                    .clone()
                                    .unwrap_or_else(|| "credential rejected".to_owned()),
                            });
                            self.push_terminal(code, reason, false);
                        } else {
                            self.pending.push_back(SocketEvent::Dropped {
                                attempt: self.attempt,
                                close_code: code,
                                close_reason: reason.clone(),
                            });
                            self.schedule_retry(code, reason);
                        }
                    }
                    LiveOutcome::Message(Some(Ok(_))) => {
                        // the tail wire is text frames only
                        let reason = "unexpected non-text frame".to_owned();
                        close_best_effort(*socket, CloseCode::Unsupported, &reason).await;
                        self.pending.push_back(SocketEvent::Dropped {
                            attempt: self.attempt,
                            close_code: None,
                            close_reason: Some(reason.clone()),
                        });
                        self.schedule_retry(None, Some(reason));
                    }
                    LiveOutcome::Message(Some(Err(err))) => {
                        let reason = err.to_string();
                        close_best_effort(*socket, CloseCode::Error, &reason).await;
                        self.pending.push_back(SocketEvent::Dropped {
                            attempt: self.attempt,
                            close_code: None,
                            close_reason: Some(reason.clone()),
                        });
                        self.schedule_retry(None, Some(reason));
                    }
                    LiveOutcome::Message(None) => {
                        let reason = "connection closed without close frame".to_owned();
                        self.pending.push_back(SocketEvent::Dropped {
                            attempt: self.attempt,
                            close_code: None,
                            close_reason: Some(reason.clone()),
                        });
                        self.schedule_retry(None, Some(reason));
                    }
                }
                continue;
            }
            let state = std::mem::replace(
                &mut self.state,
                State::Terminal(ClosedInfo {
                    close_code: None,
                    close_reason: None,
                    aborted: false,
                    graceful: false,
                }),
            );
            match state {
                State::Idle => {
                    self.attempt += 1;
                    self.state = State::Connecting;
                    return SocketEvent::ConnectAttempt {
                        attempt: self.attempt,
                    };
                }
                State::Backoff { delay } => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return self.finish_aborted().await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.attempt += 1;
                    self.state = State::Connecting;
                    return SocketEvent::ConnectAttempt {
                        attempt: self.attempt,
                    };
                }
                State::Connecting => {
                    let url = (self.url)();
                    tracing::trace!("> connecting tail socket (attempt {})..", self.attempt);
                    let connecting = connect(&url, self.bearer.as_deref());
                    let result = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return self.finish_aborted().await;
                        }
                        result = tokio::time::timeout(self.connect_timeout, connecting) => result,
                    };
                    match result {
                        Ok(Ok(socket)) => {
                            self.state = State::Live {
                                socket: Box::new(socket),
                            };
                            return SocketEvent::Open {
                                attempt: self.attempt,
                            };
                        }
                        Ok(Err(ConnectError::Auth { reason })) => {
                            self.pending.push_back(SocketEvent::AuthRejected { reason });
                            self.push_terminal(None, None, false);
                        }
                        Ok(Err(ConnectError::Other(message))) => {
                            tracing::debug!("tail connect failed: {message}");
                            self.pending.push_back(SocketEvent::ConnectFailed {
                                attempt: self.attempt,
                                message,
                            });
                            self.schedule_retry(None, None);
                        }
                        Err(_) => {
                            // the opening handshake never finished
                            let reason = "connection timeout".to_owned();
                            self.pending.push_back(SocketEvent::Dropped {
                                attempt: self.attempt,
                                close_code: Some(close_codes::CONNECT_TIMEOUT),
                                close_reason: Some(reason.clone()),
                            });
                            self.schedule_retry(
                                Some(close_codes::CONNECT_TIMEOUT),
                                Some(reason),
                            );
                        }
                    }
                }
                State::Live { .. } => unreachable!("handled above"),
                State::Terminal(info) => {
                    let event = SocketEvent::Closed {
                        close_code: info.close_code,
                        close_reason: info.close_reason.clone(),
                        aborted: info.aborted,
                        graceful: info.graceful,
                    };
                    self.state = State::Terminal(info);
                    return event;
                }
            }
        }
    }

    async fn finish_aborted(&mut self) -> SocketEvent {
        let state = std::mem::replace(
            &mut self.state,
            State::Terminal(ClosedInfo {
                close_code: Some(u16::from(CloseCode::Normal)),
                close_reason: Some("aborted".to_owned()),
                aborted: true,
                graceful: false,
            }),
        );
        if let State::Live { socket } = state {
            close_best_effort(*socket, CloseCode::Normal, "aborted").await;
        }
        SocketEvent::Closed {
            close_code: Some(u16::from(CloseCode::Normal)),
            close_reason: Some("aborted".to_owned()),
            aborted: true,
            graceful: false,
        }
    }

    fn finish_graceful(&mut self, code: Option<u16>, reason: Option<String>) -> SocketEvent {
        self.state = State::Terminal(ClosedInfo {
            close_code: code,
            close_reason: reason.clone(),
            aborted: false,
            graceful: true,
        });
        SocketEvent::Closed {
            close_code: code,
            close_reason: reason,
            aborted: false,
            graceful: true,
        }
    }

    fn push_terminal(&mut self, code: Option<u16>, reason: Option<String>, graceful: bool) {
        let info = ClosedInfo {
            close_code: code,
            close_reason: reason,
            aborted: false,
            graceful,
        };
        self.pending.push_back(SocketEvent::Closed {
            close_code: info.close_code,
            close_reason: info.close_reason.clone(),
            aborted: false,
            graceful,
        });
        self.state = State::Terminal(info);
    }

    fn schedule_retry(&mut self, close_code: Option<u16>, close_reason: Option<String>) {
        if !self.reconnect {
            self.push_terminal(close_code, close_reason, false);
            return;
        }
        if let Some(max_attempts) = self.policy.max_attempts
            && self.attempt >= max_attempts
        {
            self.pending.push_back(SocketEvent::RetryLimit {
                attempts: self.attempt,
            });
            self.push_terminal(close_code, close_reason, false);
            return;
        }
        let delay = self.policy.delay(self.attempt);
        self.pending.push_back(SocketEvent::ReconnectScheduled {
            attempt: self.attempt + 1,
            delay,
            close_code,
            close_reason,
        });
        self.state = State::Backoff { delay };
    }
}

enum LiveOutcome {
    Message(Option<Result<tungstenite::Message, tungstenite::Error>>),
    Idle,
    Aborted,
}

enum ConnectError {
    /// The server refused the handshake because of the credential.
    Auth { reason: String },
    Other(String),
}

async fn connect(url: &str, bearer: Option<&str>) -> Result<WebSocket, ConnectError> {
    let uri = url
        .parse::<tungstenite::http::Uri>()
        .map_err(|err| ConnectError::Other(format!("invalid tail url: {err}")))?;
    let mut request = ClientRequestBuilder::new(uri);
    if let Some(token) = bearer {
        request = request.with_header("Authorization", format!("Bearer {token}"));
    }
    match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(tungstenite::Error::Http(response))
            if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED
                || response.status() == tungstenite::http::StatusCode::FORBIDDEN =>
        {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            Err(ConnectError::Auth {
                reason: format!("http {}: {body}", response.status().as_u16()),
            })
        }
        Err(err) => Err(ConnectError::Other(err.to_string())),
    }
}

/// Sends a close frame and ignores every error. Mirrors the server side: we
/// are tearing the connection down anyway.
async fn close_best_effort(mut socket: WebSocket, code: CloseCode, reason: &str) {
    let _ = socket
        .close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        }))
        .await;
}

#[cfg(test)]
mod tests;
