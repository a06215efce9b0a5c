//! # v1 API types
//!
//! Data transfer objects for the version 1 Starcite API.
//!
//! This module defines the payloads exchanged between clients and the
//! server: the event record itself, the append request/response pair, the
//! session management types and the session-token issuing types. Everything
//! here is plain JSON over the wire; websocket tail frames carry one
//! [`Event`] or a non-empty array of them as a text frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ProducerSeq, Seq, SessionId};

/// An acknowledged event of a session.
///
/// Events are immutable once acknowledged and identified by [`Event::seq`],
/// which is monotonic and contiguous per session, starting at 1.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Server-assigned, session-monotonic ordinal of this event.
    pub seq: Seq,
    /// The type of the event (e.g. `content`, `chat.user.message`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary JSON payload of the event.
    pub payload: Map<String, Value>,
    /// The acting principal, by convention `user:<id>` or `agent:<name>`.
    pub actor: String,
    /// Identity of the producer that appended this event.
    pub producer_id: String,
    /// Producer-scoped, strictly increasing counter of this event.
    pub producer_seq: ProducerSeq,
    /// Origin hint of the event (e.g. `agent`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Arbitrary metadata attached to the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// References to other events or external entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Map<String, Value>>,
    /// Client-supplied idempotency key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Server-side insertion timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<String>,
}

/// A request to append one event to a session.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary JSON payload of the event.
    pub payload: Map<String, Value>,
    /// The acting principal.
    pub actor: String,
    /// Identity of the appending producer.
    pub producer_id: String,
    /// Producer-scoped, strictly increasing counter.
    pub producer_seq: ProducerSeq,
    /// Origin hint of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Arbitrary metadata attached to the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// References to other events or external entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Map<String, Value>>,
    /// Optimistic concurrency precondition: the append only succeeds if the
    /// session head equals this sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_seq: Option<Seq>,
    /// Idempotency key for server-side retry deduplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Server response to an [`AppendRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The sequence number assigned to the appended event.
    pub seq: Seq,
    /// The session head after the append.
    pub last_seq: Seq,
    /// `true` iff the server matched an earlier `(producer_id,
    /// producer_seq)` or idempotency key and returned the prior outcome.
    pub deduped: bool,
}

/// A session record as returned by the session management endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The session id.
    pub id: SessionId,
    /// The current head of the session.
    pub last_seq: Seq,
    /// Optional human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Arbitrary session metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last-update timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// A request to create a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Explicit session id. The server assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,
    /// Optional human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Arbitrary session metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// The principal creating the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_principal: Option<String>,
}

/// Server response to a session listing request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    /// The matching sessions, newest first.
    pub sessions: Vec<SessionRecord>,
    /// Opaque pagination cursor for the next page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// The scope of a minted session token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionScope {
    /// Allows tailing the session.
    #[serde(rename = "session:read")]
    Read,
    /// Allows appending to the session.
    #[serde(rename = "session:append")]
    Append,
}

/// A request to mint a short-lived session token from an API key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssueSessionTokenRequest {
    /// The session the token is scoped to.
    pub session_id: SessionId,
    /// The principal the token acts as.
    pub principal: String,
    /// The granted scopes.
    pub scopes: Vec<SessionScope>,
    /// Token lifetime in seconds. The server applies its default when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// Server response to an [`IssueSessionTokenRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssueSessionTokenResponse {
    /// The minted token.
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
}

/// The error envelope returned by the server on non-2xx responses.
///
/// Servers emit either a bare code string (`{"error": "session_exists"}`) or
/// a structured object (`{"error": {"code": …, "message": …}}`); both shapes
/// deserialize.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// The error, in either wire shape.
    pub error: ApiErrorDetail,
}

/// The two wire shapes of a server error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiErrorDetail {
    /// A bare machine-readable code.
    Code(String),
    /// A structured code/message pair.
    Detailed {
        /// Machine-readable error code.
        code: String,
        /// Human-readable message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ApiErrorDetail {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            ApiErrorDetail::Code(code) => code,
            ApiErrorDetail::Detailed { code, .. } => code,
        }
    }

    /// Returns the human-readable message, if the server sent one.
    pub fn message(&self) -> Option<&str> {
        match self {
            ApiErrorDetail::Code(_) => None,
            ApiErrorDetail::Detailed { message, .. } => message.as_deref(),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("seq", &self.seq)
            .field("type", &self.event_type)
            .field("actor", &self.actor)
            .field("producer_id", &self.producer_id)
            .field("producer_seq", &self.producer_seq)
            .finish()
    }
}

impl fmt::Debug for AppendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendRequest")
            .field("type", &self.event_type)
            .field("actor", &self.actor)
            .field("producer_id", &self.producer_id)
            .field("producer_seq", &self.producer_seq)
            .field("expected_seq", &self.expected_seq)
            .finish()
    }
}
