//! Channel and stream names derived from a host's shared secret key.
//!
//! These names are shared with deployed agents and must stay bit-exact.

use serde::{Deserialize, Serialize};

/// Name prefixes for every destination on the broker.
pub mod prefixes {
    /// Command channel (pub/sub).
    /// Format: cmd:{server_key}
    pub const COMMAND: &str = "cmd";

    /// Reply channel (pub/sub).
    /// Broadcast format: resp:{server_key}
    /// Per-command format: resp:{server_key}:{command_id}
    pub const REPLY: &str = "resp";

    /// Command log (ordered-log mode).
    /// Format: stream:cmd:{server_key}
    pub const COMMAND_STREAM: &str = "stream:cmd";

    /// Reply log (ordered-log mode).
    /// Format: stream:resp:{server_key}
    pub const REPLY_STREAM: &str = "stream:resp";

    /// Liveness side-channel, not correlated with commands.
    /// Format: heartbeat:{server_key}
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Reply-path convention chosen by the issuer of a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ReplyRoute {
    /// Legacy path shared by every command for a host: `resp:{key}`.
    #[default]
    Broadcast,
    /// Path scoped to one command: `resp:{key}:{id}`.
    PerCommand,
}

impl ReplyRoute {
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, ReplyRoute::Broadcast)
    }
}

pub fn command_channel(server_key: &str) -> String {
    format!("{}:{}", prefixes::COMMAND, server_key)
}

/// Reply channel for `command_id` under the given convention.
pub fn reply_channel(server_key: &str, route: ReplyRoute, command_id: &str) -> String {
    match route {
        ReplyRoute::Broadcast => format!("{}:{}", prefixes::REPLY, server_key),
        ReplyRoute::PerCommand => format!("{}:{}:{}", prefixes::REPLY, server_key, command_id),
    }
}

pub fn command_stream(server_key: &str) -> String {
    format!("{}:{}", prefixes::COMMAND_STREAM, server_key)
}

pub fn reply_stream(server_key: &str) -> String {
    format!("{}:{}", prefixes::REPLY_STREAM, server_key)
}

pub fn heartbeat_channel(server_key: &str) -> String {
    format!("{}:{}", prefixes::HEARTBEAT, server_key)
}

/// Validate a server key before it is spliced into channel names.
///
/// Keys are opaque secrets, but a `:` or whitespace would let one host's key
/// address another host's namespace, so both are rejected.
pub fn validate_server_key(server_key: &str) -> Result<(), &'static str> {
    if server_key.is_empty() {
        return Err("server key must not be empty");
    }
    if server_key.len() > 128 {
        return Err("server key must be at most 128 characters");
    }
    if server_key.contains(':') {
        return Err("server key must not contain ':'");
    }
    if !server_key.chars().all(|c| c.is_ascii_graphic()) {
        return Err("server key must be printable ASCII without whitespace");
    }
    Ok(())
}
