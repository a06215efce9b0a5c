//! Incremental-chat adapter.
//!
//! Adapts a [`Client`] to the AI-SDK chat transport pattern: user messages
//! become appends of `chat.user.message` events, and the session's tail is
//! projected into the UI message-chunk taxonomy a chat frontend consumes.
//!
//! Projection rules: events authored by this adapter's own agent are
//! skipped; a payload that already carries a recognized chunk `type` is
//! forwarded verbatim and the stream keeps going (streaming deltas pass
//! through); any other event is rendered as the synthetic five-chunk
//! sequence `start / text-start / text-delta / text-end / finish` and ends
//! the stream. A `chat.response.error` event finishes with reason `error`.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use starcite_types::api::v1::{CreateSessionRequest, Event};
use starcite_types::{Seq, SessionId};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::Client;
use crate::error::Error;
use crate::session::{AppendInput, ProducerIdentity, Session};
use crate::tail::{TailOptions, TailStream};

/// The producer id chat appends are deduplicated under.
const CHAT_PRODUCER_ID: &str = "producer:use-chat";

/// Triggers that regenerate an assistant answer instead of sending a new
/// user message.
const REGENERATE_TRIGGERS: [&str; 2] = ["regenerate-message", "regenerate-assistant-message"];

/// A chat message as the UI hands it to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UiMessage {
    /// Message id assigned by the UI.
    pub id: String,
    /// `user`, `assistant`, `system`, …
    pub role: String,
    /// The message parts.
    #[serde(default)]
    pub parts: Vec<UiMessagePart>,
}

/// One part of a [`UiMessage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiMessagePart {
    /// A text part.
    #[serde(rename = "text")]
    Text {
        /// The text content.
        text: String,
    },
    /// Any part kind this adapter does not consume.
    #[serde(other)]
    Unknown,
}

/// One chunk of the UI message stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiMessageChunk {
    /// A new message starts.
    #[serde(rename = "start")]
    Start {
        /// Id of the starting message.
        #[serde(rename = "messageId")]
        message_id: String,
    },
    /// A text part starts.
    #[serde(rename = "text-start")]
    TextStart {
        /// Id of the text part.
        id: String,
    },
    /// A piece of text of an open text part.
    #[serde(rename = "text-delta")]
    TextDelta {
        /// Id of the text part.
        id: String,
        /// The appended text.
        delta: String,
    },
    /// A text part is complete.
    #[serde(rename = "text-end")]
    TextEnd {
        /// Id of the text part.
        id: String,
    },
    /// The message is complete.
    #[serde(rename = "finish")]
    Finish {
        /// Why the message finished (`stop`, `error`, …).
        #[serde(rename = "finishReason")]
        finish_reason: String,
    },
}

/// Input of [`ChatTransport::send_messages`].
#[derive(Clone, Debug)]
pub struct SendMessagesInput {
    /// The chat (and session) id.
    pub chat_id: String,
    /// The UI's current message list; the latest user message is sent.
    pub messages: Vec<UiMessage>,
    /// What caused the send (`submit-message`, `regenerate-message`, …).
    pub trigger: String,
    /// Preferred id for the projected assistant message.
    pub message_id: Option<String>,
    /// Aborts the append and the returned stream when cancelled.
    pub cancel: Option<CancellationToken>,
}

/// Adapts Starcite sessions to the incremental chat pattern.
pub struct ChatTransport {
    client: Client,
    user_agent: String,
    sessions: Mutex<HashMap<String, Session>>,
    cursors: Mutex<HashMap<String, Seq>>,
}

impl ChatTransport {
    /// Creates an adapter appending as agent `use-chat`.
    pub fn new(client: Client) -> Self {
        Self::with_user_agent(client, "use-chat")
    }

    /// Creates an adapter appending as the given agent name.
    pub fn with_user_agent(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            sessions: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Sends the latest user message of `messages` and returns the chunk
    /// stream of the assistant's answer.
    ///
    /// The session is created on first use; an already existing session is
    /// fine. Regenerate triggers skip the append and replay from the last
    /// remembered cursor.
    #[instrument(level = "debug", skip_all, fields(chat = %input.chat_id))]
    pub async fn send_messages(&self, input: SendMessagesInput) -> Result<ChatChunkStream, Error> {
        match self
            .client
            .create_session(CreateSessionRequest {
                id: Some(SessionId::from(input.chat_id.as_str())),
                ..CreateSessionRequest::default()
            })
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_session_exists() => {}
            Err(err) => return Err(err),
        }
        let session = self.session_for(&input.chat_id);

        let regenerate = REGENERATE_TRIGGERS.contains(&input.trigger.as_str());
        let cursor = if regenerate {
            self.cursors
                .lock()
                .get(&input.chat_id)
                .copied()
                .unwrap_or(Seq::ZERO)
        } else {
            let text = latest_user_text(&input.messages).ok_or_else(|| {
                Error::Config("send_messages requires a user message with text".to_owned())
            })?;
            let mut payload = Map::new();
            payload.insert("text".to_owned(), Value::String(text));
            let append = AppendInput {
                payload: Some(payload),
                event_type: Some("chat.user.message".to_owned()),
                ..AppendInput::default()
            };
            let response = match &input.cancel {
                Some(cancel) => session.append_with_cancel(append, cancel).await?,
                None => session.append(append).await?,
            };
            self.cursors
                .lock()
                .insert(input.chat_id.clone(), response.seq);
            response.seq
        };

        self.open_stream(&session, cursor, input.message_id, input.cancel)
    }

    /// Reattaches to a chat's stream from the last remembered cursor, or
    /// returns `None` when this adapter has none for the chat.
    #[instrument(level = "debug", skip_all, fields(chat = chat_id))]
    pub fn reconnect_to_stream(
        &self,
        chat_id: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<Option<ChatChunkStream>, Error> {
        let Some(cursor) = self.cursors.lock().get(chat_id).copied() else {
            return Ok(None);
        };
        let session = self.session_for(chat_id);
        self.open_stream(&session, cursor, None, cancel).map(Some)
    }

    fn session_for(&self, chat_id: &str) -> Session {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(chat_id) {
            return session.clone();
        }
        let session = self.client.session_with_identity(
            chat_id,
            ProducerIdentity {
                producer_id: CHAT_PRODUCER_ID.to_owned(),
                actor: format!("agent:{}", self.user_agent),
                last_producer_seq: 0,
            },
        );
        sessions.insert(chat_id.to_owned(), session.clone());
        session
    }

    fn open_stream(
        &self,
        session: &Session,
        cursor: Seq,
        message_id: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<ChatChunkStream, Error> {
        let stream = session.tail(TailOptions {
            cursor,
            batch_size: 1,
            cancel,
            ..TailOptions::default()
        })?;
        Ok(ChatChunkStream {
            stream,
            projector: ChunkProjector::new(format!("agent:{}", self.user_agent), message_id),
            pending: VecDeque::new(),
        })
    }
}

/// A lazy stream of [`UiMessageChunk`]s.
///
/// Dropping the stream aborts the underlying tail.
pub struct ChatChunkStream {
    stream: TailStream,
    projector: ChunkProjector,
    pending: VecDeque<UiMessageChunk>,
}

impl ChatChunkStream {
    /// The next chunk. `None` once the projected message is complete or the
    /// tail ended.
    pub async fn next_chunk(&mut self) -> Option<Result<UiMessageChunk, Error>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            if self.projector.finished {
                self.stream.abort();
                return None;
            }
            match self.stream.next_event().await? {
                Ok(event) => self.pending.extend(self.projector.project(event)),
                Err(err) => return Some(Err(err)),
            }
        }
    }

    /// Requests the stream to stop.
    pub fn abort(&self) {
        self.stream.abort();
    }

    /// The highest sequence the underlying tail has consumed.
    pub fn cursor(&self) -> Seq {
        self.stream.cursor()
    }
}

/// Projects tail events into UI message chunks.
struct ChunkProjector {
    skip_actor: String,
    preferred_message_id: Option<String>,
    finished: bool,
}

impl ChunkProjector {
    fn new(skip_actor: String, preferred_message_id: Option<String>) -> Self {
        Self {
            skip_actor,
            preferred_message_id,
            finished: false,
        }
    }

    fn project(&mut self, event: Event) -> Vec<UiMessageChunk> {
        if event.actor == self.skip_actor {
            return Vec::new();
        }
        if let Some(chunk) = passthrough_chunk(&event.payload) {
            return vec![chunk];
        }
        self.finished = true;
        if event.event_type == "chat.response.error" {
            let message = string_field(&event.payload, "error")
                .or_else(|| string_field(&event.payload, "message"))
                .unwrap_or_else(|| "unknown error".to_owned());
            return self.synthetic(&event, message, "error");
        }
        let text = string_field(&event.payload, "text").unwrap_or_default();
        self.synthetic(&event, text, "stop")
    }

    fn synthetic(&self, event: &Event, text: String, finish_reason: &str) -> Vec<UiMessageChunk> {
        let message_id = string_field(&event.payload, "messageId")
            .or_else(|| self.preferred_message_id.clone())
            .unwrap_or_else(|| format!("msg-{}", event.seq));
        let text_id = string_field(&event.payload, "textPartId")
            .unwrap_or_else(|| format!("txt-{}", event.seq));
        vec![
            UiMessageChunk::Start { message_id },
            UiMessageChunk::TextStart {
                id: text_id.clone(),
            },
            UiMessageChunk::TextDelta {
                id: text_id.clone(),
                delta: text,
            },
            UiMessageChunk::TextEnd { id: text_id },
            UiMessageChunk::Finish {
                finish_reason: finish_reason.to_owned(),
            },
        ]
    }
}

/// Deserializes a payload that already carries a recognized chunk `type`.
fn passthrough_chunk(payload: &Map<String, Value>) -> Option<UiMessageChunk> {
    payload.get("type")?;
    serde_json::from_value(Value::Object(payload.clone())).ok()
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// The text of the latest user message, concatenating its text parts.
fn latest_user_text(messages: &[UiMessage]) -> Option<String> {
    let message = messages.iter().rev().find(|message| message.role == "user")?;
    let text: Vec<&str> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            UiMessagePart::Text { text } => Some(text.as_str()),
            UiMessagePart::Unknown => None,
        })
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text.join("\n"))
    }
}
