//! Typed error enums for the messaging layer.

use std::time::Duration;

use dockhand_common::ErrorCode;
use thiserror::Error;

// ── Transport errors ──────────────────────────────────────────────────────────

/// Broker-level failures. Surfaced to whichever component issued the
/// operation and never retried automatically.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("publish to '{destination}' failed: {reason}")]
    Publish { destination: String, reason: String },

    #[error("subscribe to '{destination}' failed: {reason}")]
    Subscribe { destination: String, reason: String },

    #[error("ordered-log operation on '{stream}' failed: {reason}")]
    Log { stream: String, reason: String },

    #[error("transport is closed")]
    Closed,
}

// ── Call errors ───────────────────────────────────────────────────────────────

/// Outcome of a failed [`Correlator::call`](crate::Correlator::call).
#[derive(Debug, Error)]
pub enum CallError {
    /// No matching reply before the deadline, or the reply path closed.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The agent answered with an `error` reply.
    #[error("remote error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// A reply with the right id arrived but its type or payload is wrong.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    #[error("'{0}' is not a command type")]
    NotACommand(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, CallError::Remote { .. })
    }
}

// ── Metric sink errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metric destination '{sink}' failed: {reason}")]
    Failed { sink: String, reason: String },

    #[error("metric destination '{0}' is closed")]
    Closed(String),

    #[error("invalid metric destination config: {0}")]
    Config(String),
}

impl SinkError {
    pub(crate) fn failed(sink: &str, reason: impl ToString) -> Self {
        SinkError::Failed {
            sink: sink.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_remote_are_distinguishable() {
        let timeout = CallError::Timeout(Duration::from_millis(1));
        let remote = CallError::Remote {
            code: ErrorCode::OperationFailed,
            message: "no such container".to_string(),
        };
        assert!(timeout.is_timeout() && !timeout.is_remote());
        assert!(remote.is_remote() && !remote.is_timeout());
    }

    #[test]
    fn transport_error_converts_into_call_error() {
        let err: CallError = TransportError::Closed.into();
        assert!(matches!(err, CallError::Transport(TransportError::Closed)));
    }

    #[test]
    fn remote_error_message_includes_detail() {
        let remote = CallError::Remote {
            code: ErrorCode::InvalidCommand,
            message: "unknown command type: frobnicate".to_string(),
        };
        let text = remote.to_string();
        assert!(text.contains("InvalidCommand"));
        assert!(text.contains("frobnicate"));
    }
}
