//! Shared helpers for the end-to-end test suite.

use std::time::Duration;

use starcite_client::{Client, ClientConfig, ReconnectPolicy, TailOptions};
use starcite_test_utils::TestServerHandle;

/// A client talking to the given test server.
pub fn client_for(server: &TestServerHandle) -> eyre::Result<Client> {
    Ok(Client::new(ClientConfig::new(server.base_url.clone()))?)
}

/// Tail options tuned for tests: fast reconnects without jitter.
pub fn fast_tail_options() -> TailOptions {
    TailOptions {
        reconnect_policy: ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter_ratio: 0.0,
            ..ReconnectPolicy::default()
        },
        ..TailOptions::default()
    }
}
