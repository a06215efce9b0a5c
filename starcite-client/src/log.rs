//! In-memory canonical session log.
//!
//! The log keeps a gap-free, ordered snapshot of a session and replays it to
//! new subscribers. Its contiguity check and its silent skipping of already
//! applied events are what turn the tail stream's at-least-once redelivery
//! into exactly-once application: overlapping batches after a reconnect
//! collapse, and a batch that would leave a hole is rejected so the owner
//! can backfill from the last applied sequence.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use starcite_types::Seq;
use starcite_types::api::v1::Event;
use tokio::sync::mpsc;

use crate::error::Error;

/// A snapshot of the log's state.
#[derive(Clone, Debug)]
pub struct LogSnapshot {
    /// The retained events, oldest first.
    pub events: Vec<Event>,
    /// The highest applied sequence. Reflects the true head even when
    /// retention evicted older events.
    pub last_seq: Seq,
    /// Whether a background sync currently feeds this log.
    pub syncing: bool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
}

struct LogInner {
    events: VecDeque<Event>,
    last_seq: Seq,
    max_events: Option<usize>,
    syncing: bool,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// The in-memory canonical log of one session.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SessionLog {
    inner: Arc<Mutex<LogInner>>,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLog {
    /// Creates an empty log without retention bound.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                events: VecDeque::new(),
                last_seq: Seq::ZERO,
                max_events: None,
                syncing: false,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    /// The highest applied sequence.
    pub fn last_seq(&self) -> Seq {
        self.inner.lock().last_seq
    }

    /// Applies a batch of events and publishes the fresh ones to
    /// subscribers. Returns the number of newly applied events.
    ///
    /// Events at or below the current head are skipped silently. A batch
    /// whose first fresh event does not directly extend the head is rejected
    /// whole with [`Error::SessionLogGap`] and the log stays unchanged.
    pub fn apply_batch(&self, events: &[Event]) -> Result<usize, Error> {
        let mut inner = self.inner.lock();
        let fresh: Vec<&Event> = events
            .iter()
            .filter(|event| event.seq > inner.last_seq)
            .collect();
        // validate contiguity before touching anything
        let mut expected = inner.last_seq.next();
        for event in &fresh {
            if event.seq != expected {
                return Err(Error::SessionLogGap {
                    expected,
                    got: event.seq,
                });
            }
            expected = expected.next();
        }
        let applied = fresh.len();
        for event in fresh {
            inner.last_seq = event.seq;
            inner.events.push_back(event.clone());
            if let Some(max_events) = inner.max_events {
                while inner.events.len() > max_events {
                    inner.events.pop_front();
                }
            }
            // a subscriber whose receiver is gone is cancelled here
            let event = event.clone();
            inner
                .subscribers
                .retain(|subscriber| subscriber.tx.send(event.clone()).is_ok());
        }
        Ok(applied)
    }

    /// Subscribes to the log.
    ///
    /// With `replay`, the retained events are queued on the subscription in
    /// order before this call returns.
    pub fn subscribe(&self, replay: bool) -> LogSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if replay {
            for event in &inner.events {
                // cannot fail, we hold the receiver
                let _ = tx.send(event.clone());
            }
        }
        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        inner.subscribers.push(Subscriber { id, tx });
        LogSubscription {
            id,
            rx,
            log: self.clone(),
        }
    }

    /// Returns a snapshot of the retained events and the head.
    pub fn snapshot(&self) -> LogSnapshot {
        let inner = self.inner.lock();
        LogSnapshot {
            events: inner.events.iter().cloned().collect(),
            last_seq: inner.last_seq,
            syncing: inner.syncing,
        }
    }

    /// Bounds the number of retained events. `None` removes the bound.
    /// Shrinking evicts the oldest events immediately; `last_seq` is
    /// unaffected.
    pub fn set_max_events(&self, max_events: Option<usize>) {
        let mut inner = self.inner.lock();
        inner.max_events = max_events;
        if let Some(max_events) = max_events {
            while inner.events.len() > max_events {
                inner.events.pop_front();
            }
        }
    }

    /// The number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.inner.lock().syncing = syncing;
    }

    fn unsubscribe(&self, id: u64) {
        self.inner
            .lock()
            .subscribers
            .retain(|subscriber| subscriber.id != id);
    }
}

/// A live subscription to a [`SessionLog`].
///
/// Dropping the subscription unsubscribes.
pub struct LogSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    log: SessionLog,
}

impl LogSubscription {
    /// The next event, in log order. `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`LogSubscription::next`].
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.log.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests;
