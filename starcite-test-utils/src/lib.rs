//! Test infrastructure for the Starcite client SDK.
//!
//! Provides an in-process Starcite server with the append/tail semantics
//! the SDK depends on, plus fault injection for reconnect scenarios and
//! health-check helpers for spawned servers.

pub mod health_checks;
mod server;
mod store;

pub use server::{FaultPlan, TestServerHandle, spawn_server, spawn_server_with_api_key, starcite_router};
pub use store::{SessionStore, StoreError};
