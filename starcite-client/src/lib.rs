#![deny(missing_docs, clippy::unwrap_used)]
//! Client SDK for the Starcite append-only event log.
//!
//! Starcite stores one ordered, contiguous event log per session. This crate
//! provides the resume-safe client core for it: an append pipeline with
//! per-producer sequencing and idempotent retries, a managed websocket tail
//! with reconnects and cursor-preserving resume, a durable cursor-
//! checkpointing consumer, an in-memory canonical log for live
//! subscriptions, and an adapter projecting sessions onto the incremental
//! chat pattern.
//!
//! Most applications start with a [`Client`]:
//!
//! ```rust,ignore
//! let client = Client::new(ClientConfig::new("http://localhost:4800").with_api_key(key))?;
//! let session = client.session("support:4711");
//! session.append(AppendInput::text("hello")).await?;
//! let mut tail = session.tail(TailOptions::default())?;
//! while let Some(event) = tail.next_event().await {
//!     handle(event?);
//! }
//! ```
//!
//! Every long-running operation takes a
//! [`CancellationToken`](tokio_util::sync::CancellationToken); aborting a
//! tail closes its socket gracefully and never loses acknowledged data — the
//! next stream resumes from the cursor.

mod chat;
mod client;
mod cursor;
mod error;
mod frame;
mod http;
mod log;
mod session;
mod tail;
mod ws;

pub use chat::{
    ChatChunkStream, ChatTransport, SendMessagesInput, UiMessage, UiMessageChunk, UiMessagePart,
};
pub use client::{Client, ClientConfig, ListSessionsQuery};
pub use cursor::{CursorStore, FileCursorStore, InMemoryCursorStore};
pub use error::{BoxError, Error, TailStage};
pub use log::{LogSnapshot, LogSubscription, SessionLog};
pub use session::{
    AppendInput, ConsumeOptions, ProducerIdentity, Session, SessionSubscription,
};
pub use tail::{
    LifecycleCallback, StreamEndReason, TailLifecycleEvent, TailOptions, TailStream, WsAuth,
};
pub use ws::ReconnectPolicy;
