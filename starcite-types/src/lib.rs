#![deny(missing_docs)]
//! Core type definitions for the Starcite event log service and its clients.
//!
//! This crate groups together the strongly-typed values and message
//! structures shared between Starcite servers and client SDKs. It provides:
//!
//! * Thin wrappers around primitive values such as event sequence numbers,
//!   producer sequence numbers and session identifiers, with consistent
//!   serialization and display implementations.
//! * Versioned API types for client/server communication (see [`api`]).
//!
//! Use these types to pass, store, and (de)serialize identifiers and wire
//! payloads in a type-safe way throughout your application.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod api;

/// A server-assigned, session-monotonic event ordinal.
///
/// The first event of a session has `seq = 1` and subsequent events are
/// contiguous. `Seq` doubles as a cursor: a cursor of `n` means "deliver
/// events with `seq > n`", so [`Seq::ZERO`] requests a session from the very
/// beginning.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Seq(u64);

/// A client-scoped, strictly increasing counter identifying an append within
/// one producer.
///
/// Together with the producer id it lets the server deduplicate retries and
/// enforce submission order per producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerSeq(u64);

/// The identifier of a Starcite session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl Seq {
    /// The zero sequence, used as the initial cursor of a fresh tail.
    pub const ZERO: Seq = Seq(0);

    /// Creates a new `Seq` by wrapping a `u64`.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Converts the sequence number to a `u64`.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    pub fn next(self) -> Seq {
        Self(self.0 + 1)
    }

    /// Returns `true` iff this is the zero sequence.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl ProducerSeq {
    /// Creates a new `ProducerSeq` by wrapping a `u64`.
    ///
    /// Producer sequences start at 1; `0` is never a valid value on the
    /// wire.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Converts the producer sequence to a `u64`.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl SessionId {
    /// Creates a new `SessionId` by wrapping a `String`.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Converts the session id into the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns the session id as a `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Seq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u64> for ProducerSeq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

impl fmt::Display for ProducerSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
