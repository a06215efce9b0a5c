//! The error surface of the SDK.
//!
//! Every fallible operation of this crate returns the crate-level [`Error`].
//! The variants form the semantic taxonomy callers discriminate on: server
//! rejections carry their structured code, transport failures are separated
//! from contract violations, and the tail-specific failure modes (retry
//! budget exhausted, buffer overflow, token expiry) each have their own
//! variant so callers can react without string matching.

use starcite_types::{Seq, SessionId};

/// A boxed error produced by user-supplied handlers and cursor stores.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The stage a tail stream was in when it failed for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailStage {
    /// Establishing a websocket connection.
    Connect,
    /// Reading or parsing an incoming frame.
    Frame,
    /// Handing events to the downstream consumer.
    Apply,
    /// Waiting for or scheduling a reconnect.
    Reconnect,
}

impl std::fmt::Display for TailStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            TailStage::Connect => "connect",
            TailStage::Frame => "frame",
            TailStage::Apply => "apply",
            TailStage::Reconnect => "reconnect",
        };
        f.write_str(stage)
    }
}

/// Errors returned by the Starcite client SDK.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The SDK was configured with an invalid value (bad base URL, empty
    /// filter key, out-of-range batch size).
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The peer could not be reached, or it violated the wire contract in a
    /// way a reconnect cannot fix (non-JSON body, malformed tail frame).
    #[error("connection error: {0}")]
    Connection(String),
    /// The server answered with a non-2xx status.
    #[error("api error ({status} {code}): {message}")]
    Api {
        /// HTTP status code of the response.
        status: u16,
        /// Machine-readable error code (`http_<status>` when the server sent
        /// no structured body).
        code: String,
        /// Human-readable message.
        message: String,
        /// The raw error body, when one was parseable.
        payload: Option<serde_json::Value>,
    },
    /// A 2xx response body did not match the expected schema. This is a
    /// client/server contract violation, not a network hiccup.
    #[error("response did not match schema: {0}")]
    Schema(String),
    /// A tail stream failed for good after its internal retries.
    #[error("tail of session {session} failed during {stage}: {message}")]
    Tail {
        /// The session being tailed.
        session: SessionId,
        /// The stage the stream was in.
        stage: TailStage,
        /// What went wrong.
        message: String,
    },
    /// The tail buffer would have exceeded its bound because the consumer
    /// could not keep up.
    #[error("tail buffer of session {session} exceeded {max_buffered_batches} batches")]
    Backpressure {
        /// The session being tailed.
        session: SessionId,
        /// The configured buffer bound.
        max_buffered_batches: usize,
    },
    /// The session token expired. Callers can mint a fresh token and resume
    /// from the last cursor.
    #[error("session token expired")]
    TokenExpired,
    /// A batch left a hole in the session log.
    ///
    /// This is an internal resynchronization signal of the live-subscription
    /// machinery and only surfaces to callers that drive a [`crate::SessionLog`]
    /// by hand.
    #[error("session log gap: expected seq {expected}, got {got}")]
    SessionLogGap {
        /// The next sequence the log would have accepted.
        expected: Seq,
        /// The first sequence of the rejected batch.
        got: Seq,
    },
    /// The consume handler rejected an event. The cursor was not advanced.
    #[error("consume handler failed at seq {seq} of session {session}")]
    Handler {
        /// The session being consumed.
        session: SessionId,
        /// The event the handler rejected.
        seq: Seq,
        /// The handler's error.
        #[source]
        source: BoxError,
    },
    /// A cursor store operation failed.
    #[error("cursor store failed for session {session}")]
    CursorStore {
        /// The session whose cursor was accessed.
        session: SessionId,
        /// The store's error.
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Returns `true` iff the server rejected a session creation because the
    /// session already exists.
    pub fn is_session_exists(&self) -> bool {
        matches!(self, Error::Api { code, .. } if code == "session_exists")
    }
}
