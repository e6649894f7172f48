use serde::{Deserialize, Serialize};

/// How a host connection reaches the broker. Chosen once per connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TransportMode {
    /// Direct pub/sub on the broker.
    #[default]
    Pubsub,
    /// Ordered-log streams on the broker.
    Streams,
    /// Pub/sub tunneled through the HTTP relay.
    Http,
}

/// Reply deadlines per command class, in seconds.
pub mod timeouts {
    /// Read-only queries and ping.
    pub const QUERY_SECS: u64 = 30;

    /// start/stop/restart/remove may wait on a graceful container shutdown.
    pub const CONTAINER_LIFECYCLE_SECS: u64 = 60;

    /// create may pull an image first.
    pub const CREATE_CONTAINER_SECS: u64 = 120;
}

pub fn default_valkey_url() -> String {
    "redis://valkey:6379".to_string()
}
