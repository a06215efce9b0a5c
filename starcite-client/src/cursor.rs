//! Cursor persistence for durable consumption.
//!
//! [`crate::Session::consume`] checkpoints the last handled sequence through
//! this port after every event, so a restarted consumer resumes where it
//! left off. The SDK ships an in-memory adapter for tests and short-lived
//! processes, and a file-backed adapter for anything that should survive a
//! restart.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use starcite_types::{Seq, SessionId};

use crate::error::BoxError;

/// Persistence port for consumption cursors.
///
/// Implementations must be safe for the SDK's cooperative access pattern
/// (load once at start, save after each handled event). Coordinating
/// concurrent writers across processes is the application's business.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// The stored cursor of `session`, or `None` when nothing usable is
    /// stored.
    async fn load(&self, session: &SessionId) -> Result<Option<Seq>, BoxError>;

    /// Stores `cursor` for `session`.
    async fn save(&self, session: &SessionId, cursor: Seq) -> Result<(), BoxError>;
}

/// A cursor store that lives and dies with the process.
#[derive(Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<SessionId, Seq>>,
}

impl InMemoryCursorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, session: &SessionId) -> Result<Option<Seq>, BoxError> {
        Ok(self.cursors.lock().get(session).copied())
    }

    async fn save(&self, session: &SessionId, cursor: Seq) -> Result<(), BoxError> {
        self.cursors.lock().insert(session.clone(), cursor);
        Ok(())
    }
}

/// A cursor store backed by one file per session.
///
/// Files are named `<prefix>:<session>:lastSeq` inside the configured
/// directory and hold the cursor as a decimal string. Contents that do not
/// parse are treated as "no stored cursor" rather than an error, so a
/// corrupted file only costs redelivery.
pub struct FileCursorStore {
    dir: PathBuf,
    prefix: String,
}

impl FileCursorStore {
    /// Creates a store writing to `dir` with the default `starcite` prefix.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_prefix(dir, "starcite")
    }

    /// Creates a store writing to `dir` with a custom key prefix.
    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// The directory this store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{}:{session}:lastSeq", self.prefix))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, session: &SessionId) -> Result<Option<Seq>, BoxError> {
        let contents = match tokio::fs::read_to_string(self.path(session)).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match contents.trim().parse::<u64>() {
            Ok(cursor) => Ok(Some(Seq::new(cursor))),
            Err(err) => {
                tracing::debug!("ignoring unparsable cursor for {session}: {err}");
                Ok(None)
            }
        }
    }

    async fn save(&self, session: &SessionId, cursor: Seq) -> Result<(), BoxError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path(session), cursor.into_inner().to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
