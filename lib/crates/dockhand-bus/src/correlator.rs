//! Controller-side synchronous calls over the asynchronous broker.

use std::sync::Arc;
use std::time::Duration;

use dockhand_common::{
    command_channel, command_stream, reply_channel, reply_stream, Envelope, ErrorPayload,
    MessageType,
};
use tokio::time::Instant;

use crate::cursor::CursorReader;
use crate::error::{CallError, TransportError};
use crate::log_entry;
use crate::transport::{Link, OrderedLog, Subscription, Transport};

/// Upper bound on a single blocking read of the reply stream.
const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(1);

/// Issues commands to agents and waits for the matching reply.
///
/// The reply path is always open before the command is sent: in pub/sub
/// mode the correlator subscribes first, in streams mode it snapshots the
/// reply-stream tail before appending. A fast agent can therefore never
/// answer into a path nobody listens on.
#[derive(Clone)]
pub struct Correlator {
    link: Link,
    poll_wait: Duration,
}

impl Correlator {
    pub fn new(link: Link) -> Self {
        Self {
            link,
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }

    #[must_use]
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    /// Call with the default deadline for `kind`.
    ///
    /// # Errors
    ///
    /// See [`Correlator::call`].
    pub async fn call_default(
        &self,
        host_key: &str,
        kind: MessageType,
        payload: serde_json::Value,
    ) -> Result<Envelope, CallError> {
        let timeout = kind.default_timeout();
        self.call(host_key, kind, payload, timeout).await
    }

    /// Send `kind` to the agent identified by `host_key` and wait up to
    /// `timeout` for its reply.
    ///
    /// Returns the reply envelope once its payload has been checked against
    /// the shape of the expected reply type.
    ///
    /// # Errors
    ///
    /// - [`CallError::Timeout`] if no reply arrives in time or the reply path
    ///   closes.
    /// - [`CallError::Remote`] if the agent answers with an `error` reply.
    /// - [`CallError::InvalidReply`] on a reply of the wrong type or shape.
    /// - [`CallError::Transport`] if subscribing or sending fails.
    pub async fn call(
        &self,
        host_key: &str,
        kind: MessageType,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Envelope, CallError> {
        let Some(expected) = kind.reply_type() else {
            return Err(CallError::NotACommand(kind.to_string()));
        };
        let deadline = Instant::now() + timeout;
        let command = Envelope::command(kind, payload).with_reply_route(self.link.reply_route());
        tracing::debug!(
            command_id = %command.id,
            kind = %command.kind,
            mode = self.link.mode_name(),
            "issuing command"
        );

        let reply = match &self.link {
            Link::PubSub { transport, route } => {
                let destination = reply_channel(host_key, *route, &command.id);
                let subscription = transport.subscribe(&destination).await?;
                call_pubsub(transport.as_ref(), host_key, &command, subscription, deadline).await
            }
            Link::Streams(log) => {
                self.call_streams(log, host_key, &command, deadline).await
            }
        };

        match reply {
            Ok(Some(reply)) => check_reply(&expected, reply),
            Ok(None) => {
                tracing::debug!(command_id = %command.id, ?timeout, "command timed out");
                Err(CallError::Timeout(timeout))
            }
            Err(e) => Err(e),
        }
    }

    async fn call_streams(
        &self,
        log: &Arc<dyn OrderedLog>,
        host_key: &str,
        command: &Envelope,
        deadline: Instant,
    ) -> Result<Option<Envelope>, CallError> {
        let replies = reply_stream(host_key);
        let start = log.tail(&replies).await?;
        log.append(&command_stream(host_key), &log_entry::command_fields(command))
            .await?;

        let mut reader = CursorReader::new(Arc::clone(log), replies)
            .with_cursor(start)
            .with_wait(self.poll_wait);
        match tokio::time::timeout_at(deadline, next_stream_reply(&mut reader, &command.id)).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(e)) => Err(CallError::Transport(e)),
            Err(_) => Ok(None),
        }
    }
}

/// First reply entry for `command_id` appearing after the reader's cursor.
async fn next_stream_reply(
    reader: &mut CursorReader,
    command_id: &str,
) -> Result<Envelope, TransportError> {
    loop {
        for entry in reader.poll().await? {
            match log_entry::reply_from_entry(&entry) {
                Ok(reply) if reply.id == command_id => return Ok(reply),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(entry_id = %entry.id, error = %e, "skipping bad reply entry");
                }
            }
        }
    }
}

/// Publish `command` and wait for its reply on an already-open subscription.
/// The subscription is closed on every path out.
async fn call_pubsub(
    transport: &dyn Transport,
    host_key: &str,
    command: &Envelope,
    mut subscription: Subscription,
    deadline: Instant,
) -> Result<Option<Envelope>, CallError> {
    let outcome = match transport
        .publish(&command_channel(host_key), &command.encode())
        .await
    {
        Ok(()) => Ok(
            tokio::time::timeout_at(deadline, next_reply(&mut subscription, &command.id))
                .await
                .ok()
                .flatten(),
        ),
        Err(e) => Err(CallError::Transport(e)),
    };
    subscription.close();
    outcome
}

/// Next reply carrying `command_id`, or `None` once the subscription closes.
async fn next_reply(subscription: &mut Subscription, command_id: &str) -> Option<Envelope> {
    while let Some(bytes) = subscription.recv().await {
        match Envelope::decode(&bytes) {
            Ok(reply) if reply.id == command_id => return Some(reply),
            Ok(other) => {
                tracing::trace!(reply_id = %other.id, "ignoring reply for another command");
            }
            Err(e) => tracing::debug!(error = %e, "ignoring undecodable reply"),
        }
    }
    tracing::debug!(destination = subscription.destination(), "reply subscription closed");
    None
}

fn check_reply(expected: &MessageType, reply: Envelope) -> Result<Envelope, CallError> {
    if reply.kind == MessageType::Error {
        let ErrorPayload { code, message } = reply
            .payload_as()
            .map_err(|e| CallError::InvalidReply(e.to_string()))?;
        return Err(CallError::Remote { code, message });
    }
    if &reply.kind != expected {
        return Err(CallError::InvalidReply(format!(
            "expected '{expected}', got '{}'",
            reply.kind
        )));
    }
    reply
        .typed_payload()
        .map_err(|e| CallError::InvalidReply(e.to_string()))?;
    Ok(reply)
}
