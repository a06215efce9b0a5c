//! In-memory session store of the test server.
//!
//! Implements the server-side semantics the SDK relies on: contiguous
//! per-session sequences, append deduplication by `(producer_id,
//! producer_seq)` and idempotency key, the `expected_seq` precondition, and
//! broadcast fan-out to live tails.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use starcite_types::api::v1::{
    AppendRequest, AppendResponse, CreateSessionRequest, Event, SessionRecord,
};
use starcite_types::{Seq, SessionId};
use tokio::sync::broadcast;

/// Why the store rejected a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// A session with this id already exists.
    SessionExists,
    /// The addressed session does not exist.
    SessionNotFound,
    /// The `expected_seq` precondition did not hold.
    SeqConflict { last_seq: Seq },
}

impl StoreError {
    /// The wire error code of this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::SessionExists => "session_exists",
            StoreError::SessionNotFound => "session_not_found",
            StoreError::SeqConflict { .. } => "seq_conflict",
        }
    }
}

struct SessionState {
    record: SessionRecord,
    events: Vec<Event>,
    by_producer: HashMap<(String, u64), AppendResponse>,
    by_idempotency_key: HashMap<String, AppendResponse>,
    notify: broadcast::Sender<Event>,
}

/// The shared in-memory state of one test server.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, SessionState>>>,
    order: Arc<Mutex<Vec<SessionId>>>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session.
    pub fn create(&self, request: CreateSessionRequest) -> Result<SessionRecord, StoreError> {
        let id = request
            .id
            .unwrap_or_else(|| SessionId::new(uuid::Uuid::new_v4().to_string()));
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(StoreError::SessionExists);
        }
        let record = SessionRecord {
            id: id.clone(),
            last_seq: Seq::ZERO,
            title: request.title,
            metadata: request.metadata.unwrap_or_default(),
            created_at: Some("2024-01-01T00:00:00Z".to_owned()),
            updated_at: Some("2024-01-01T00:00:00Z".to_owned()),
        };
        let (notify, _) = broadcast::channel(1024);
        sessions.insert(
            id.clone(),
            SessionState {
                record: record.clone(),
                events: Vec::new(),
                by_producer: HashMap::new(),
                by_idempotency_key: HashMap::new(),
                notify,
            },
        );
        self.order.lock().push(id);
        Ok(record)
    }

    /// Lists sessions in creation order, applying metadata equality filters
    /// and cursor pagination.
    ///
    /// The cursor is the opaque token of a previous page's `next_cursor`
    /// (the id of that page's last session); listing resumes strictly after
    /// it. Returns the page and, when `limit` cut the result short, the
    /// cursor for the next page.
    pub fn list(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
        metadata: &[(String, String)],
    ) -> (Vec<SessionRecord>, Option<String>) {
        let sessions = self.sessions.lock();
        let order = self.order.lock();
        let mut records: Vec<SessionRecord> = order
            .iter()
            .filter_map(|id| sessions.get(id))
            .filter(|state| {
                metadata.iter().all(|(key, value)| {
                    state.record.metadata.get(key).and_then(|v| v.as_str()) == Some(value.as_str())
                })
            })
            .map(|state| state.record.clone())
            .collect();
        if let Some(cursor) = cursor
            && let Some(position) = records
                .iter()
                .position(|record| record.id.as_str() == cursor)
        {
            records.drain(..=position);
        }
        let mut next_cursor = None;
        if let Some(limit) = limit
            && records.len() > limit
        {
            records.truncate(limit);
            next_cursor = records.last().map(|record| record.id.to_string());
        }
        (records, next_cursor)
    }

    /// Appends one event, honoring dedupe and the `expected_seq`
    /// precondition.
    pub fn append(
        &self,
        id: &SessionId,
        request: AppendRequest,
    ) -> Result<AppendResponse, StoreError> {
        let mut sessions = self.sessions.lock();
        let state = sessions.get_mut(id).ok_or(StoreError::SessionNotFound)?;

        let producer_key = (
            request.producer_id.clone(),
            request.producer_seq.into_inner(),
        );
        if let Some(prior) = state.by_producer.get(&producer_key) {
            return Ok(AppendResponse {
                deduped: true,
                ..*prior
            });
        }
        if let Some(key) = &request.idempotency_key
            && let Some(prior) = state.by_idempotency_key.get(key)
        {
            return Ok(AppendResponse {
                deduped: true,
                ..*prior
            });
        }
        if let Some(expected_seq) = request.expected_seq
            && expected_seq != state.record.last_seq
        {
            return Err(StoreError::SeqConflict {
                last_seq: state.record.last_seq,
            });
        }

        let seq = state.record.last_seq.next();
        let event = Event {
            seq,
            event_type: request.event_type,
            payload: request.payload,
            actor: request.actor,
            producer_id: request.producer_id,
            producer_seq: request.producer_seq,
            source: request.source,
            metadata: request.metadata,
            refs: request.refs,
            idempotency_key: request.idempotency_key.clone(),
            inserted_at: Some("2024-01-01T00:00:00Z".to_owned()),
        };
        state.record.last_seq = seq;
        state.events.push(event.clone());
        let response = AppendResponse {
            seq,
            last_seq: seq,
            deduped: false,
        };
        state.by_producer.insert(producer_key, response);
        if let Some(key) = request.idempotency_key {
            state.by_idempotency_key.insert(key, response);
        }
        // no receiver means no live tail, which is fine
        let _ = state.notify.send(event);
        Ok(response)
    }

    /// The stored events with `seq > cursor` plus a live receiver,
    /// atomically so a tail misses nothing in between.
    pub fn tail_from(
        &self,
        id: &SessionId,
        cursor: Seq,
    ) -> Result<(Vec<Event>, broadcast::Receiver<Event>), StoreError> {
        let sessions = self.sessions.lock();
        let state = sessions.get(id).ok_or(StoreError::SessionNotFound)?;
        let backlog = state
            .events
            .iter()
            .filter(|event| event.seq > cursor)
            .cloned()
            .collect();
        Ok((backlog, state.notify.subscribe()))
    }

    /// The head of a session.
    pub fn last_seq(&self, id: &SessionId) -> Option<Seq> {
        self.sessions
            .lock()
            .get(id)
            .map(|state| state.record.last_seq)
    }
}
