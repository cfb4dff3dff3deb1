//! Synchronization configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the synchronization core
///
/// One `SyncConfig` is shared by every cache and connection built from the
/// same service context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bounded wait on the resolver's dequeue; also how often an idle
    /// worker re-checks its exit conditions
    pub queue_poll: Duration,
    /// Timeout for opening the push socket
    pub connect_timeout: Duration,
    /// Timeout for a single pull request (bulk listing or fetch-by-id)
    pub fetch_timeout: Duration,
    /// Whether the first-sync ordering hook runs again after every
    /// reconnect, rather than only on the first connection ever
    pub resort_on_reconnect: bool,
    /// Fixed `host:port` of the companion service, bypassing discovery
    pub endpoint_override: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_poll: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(10),
            resort_on_reconnect: true,
            endpoint_override: None,
        }
    }
}

impl SyncConfig {
    /// Config tuned for tests: short waits so drain detection is fast
    pub fn fast() -> Self {
        Self {
            queue_poll: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Set a fixed endpoint, bypassing file-based discovery
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }
}
