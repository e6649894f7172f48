//! Agent-side receive loop.
//!
//! Each decoded command runs in its own task and produces exactly one reply,
//! published on the path matching the command's id and reply route.
//! Undecodable messages are logged and dropped without a reply.
//!
//! In streams mode the command log is read from its origin on every start.
//! Entries that already have a reply on the reply stream are skipped, and a
//! command older than its default timeout gets an `error` reply without its
//! handler running.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dockhand_common::{
    command_channel, command_stream, reply_channel, reply_stream, Envelope, ErrorCode,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::cursor::CursorReader;
use crate::error::TransportError;
use crate::log_entry;
use crate::router::CommandRouter;
use crate::shutdown;
use crate::transport::{Link, OrderedLog, Subscription, Transport, SUBSCRIPTION_BUFFER};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Page size when collecting answered command ids at startup.
const ANSWERED_SCAN_BATCH: usize = 500;

/// True once no caller can still be waiting under the default deadline.
pub fn is_stale(command: &Envelope, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(command.kind.default_timeout())
        .is_ok_and(|deadline| command.timestamp + deadline < now)
}

/// Ids of every command with a reply already on `stream`.
async fn answered_commands(
    log: &Arc<dyn OrderedLog>,
    stream: &str,
) -> Result<HashSet<String>, TransportError> {
    let mut reader = CursorReader::new(Arc::clone(log), stream)
        .with_wait(Duration::from_millis(1))
        .with_batch(ANSWERED_SCAN_BATCH);
    let mut answered = HashSet::new();
    loop {
        let entries = reader.poll().await?;
        if entries.is_empty() {
            return Ok(answered);
        }
        answered.extend(
            entries
                .iter()
                .filter_map(|entry| entry.field(log_entry::FIELD_COMMAND_ID))
                .map(str::to_string),
        );
    }
}

/// Lifecycle: `Idle → Subscribed ⇄ Dispatching → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    /// Listening, nothing in flight.
    Subscribed,
    /// At least one command is being handled.
    Dispatching,
    Stopped,
}

// ── Reply path ────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum ReplyPath {
    PubSub {
        transport: Arc<dyn Transport>,
        server_key: Arc<str>,
    },
    Streams {
        log: Arc<dyn OrderedLog>,
        stream: Arc<str>,
    },
}

impl ReplyPath {
    async fn send(&self, reply: &Envelope) -> Result<(), TransportError> {
        match self {
            ReplyPath::PubSub {
                transport,
                server_key,
            } => {
                let destination = reply_channel(server_key, reply.reply_route, &reply.id);
                transport.publish(&destination, &reply.encode()).await
            }
            ReplyPath::Streams { log, stream } => log
                .append(stream, &log_entry::reply_fields(reply))
                .await
                .map(|_| ()),
        }
    }
}

// ── Inbox ─────────────────────────────────────────────────────────────────────

enum Inbox {
    PubSub(Subscription),
    Streams {
        rx: mpsc::Receiver<Envelope>,
        reader: JoinHandle<()>,
    },
}

impl Inbox {
    /// Next decoded command; `None` once the source is closed.
    async fn next(&mut self) -> Option<Envelope> {
        match self {
            Inbox::PubSub(subscription) => loop {
                let bytes = subscription.recv().await?;
                match Envelope::decode(&bytes) {
                    Ok(command) => return Some(command),
                    Err(e) => tracing::warn!(error = %e, "dropping malformed command"),
                }
            },
            Inbox::Streams { rx, .. } => rx.recv().await,
        }
    }

    fn close(self) {
        match self {
            Inbox::PubSub(subscription) => subscription.close(),
            Inbox::Streams { reader, .. } => reader.abort(),
        }
    }
}

/// Feed commands from the command stream into a queue, skipping `answered`.
/// Runs until aborted.
fn spawn_stream_reader(
    mut reader: CursorReader,
    answered: HashSet<String>,
) -> (mpsc::Receiver<Envelope>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let handle = tokio::spawn(async move {
        loop {
            for entry in reader.next_batch().await {
                match log_entry::command_from_entry(&entry) {
                    Ok(command) if answered.contains(&command.id) => {
                        tracing::debug!(command_id = %command.id, "skipping answered command");
                    }
                    Ok(command) => {
                        if tx.send(command).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(entry_id = %entry.id, error = %e, "dropping malformed command entry");
                    }
                }
            }
        }
    });
    (rx, handle)
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    server_key: Arc<str>,
    link: Link,
    router: CommandRouter,
    grace_period: Duration,
    stream_wait: Duration,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    pub fn new(server_key: &str, link: Link, router: CommandRouter) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            server_key: Arc::from(server_key),
            link,
            router,
            grace_period: DEFAULT_GRACE_PERIOD,
            stream_wait: Duration::from_secs(5),
            state,
        }
    }

    /// How long in-flight commands may run after shutdown before they are aborted.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Blocking-read bound for the command stream in streams mode.
    #[must_use]
    pub fn with_stream_wait(mut self, wait: Duration) -> Self {
        self.stream_wait = wait;
        self
    }

    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: DispatcherState) {
        self.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    /// Receive and dispatch commands until `stop` fires or the command
    /// source closes.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the command source cannot be opened.
    /// Failures after that are logged and end or skip work without an error.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), TransportError> {
        let result = self.run_inner(&mut stop).await;
        self.set_state(DispatcherState::Stopped);
        tracing::info!("dispatcher stopped");
        result
    }

    async fn run_inner(&self, stop: &mut watch::Receiver<bool>) -> Result<(), TransportError> {
        let (mut inbox, replies) = self.open().await?;
        self.set_state(DispatcherState::Subscribed);
        tracing::info!(mode = self.link.mode_name(), "dispatcher listening");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown::wait_for(stop) => {
                    tracing::info!("dispatcher shutting down");
                    break;
                }
                command = inbox.next() => {
                    let Some(command) = command else {
                        tracing::warn!("command source closed");
                        break;
                    };
                    self.spawn_command(&mut tasks, command, replies.clone());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "command task failed");
                    }
                    if tasks.is_empty() {
                        self.set_state(DispatcherState::Subscribed);
                    }
                }
            }
        }
        inbox.close();
        self.drain(tasks).await;
        Ok(())
    }

    async fn open(&self) -> Result<(Inbox, ReplyPath), TransportError> {
        match &self.link {
            Link::PubSub { transport, .. } => {
                let subscription = transport.subscribe(&command_channel(&self.server_key)).await?;
                let replies = ReplyPath::PubSub {
                    transport: Arc::clone(transport),
                    server_key: Arc::clone(&self.server_key),
                };
                Ok((Inbox::PubSub(subscription), replies))
            }
            Link::Streams(log) => {
                let commands = command_stream(&self.server_key);
                // Surfaces an unreachable broker before the reader starts retrying.
                log.tail(&commands).await?;
                let stream = reply_stream(&self.server_key);
                let answered = answered_commands(log, &stream).await?;
                if !answered.is_empty() {
                    tracing::info!(answered = answered.len(), "replayed commands with replies will be skipped");
                }
                let reader = CursorReader::new(Arc::clone(log), commands).with_wait(self.stream_wait);
                let (rx, reader) = spawn_stream_reader(reader, answered);
                let replies = ReplyPath::Streams {
                    log: Arc::clone(log),
                    stream: Arc::from(stream),
                };
                Ok((Inbox::Streams { rx, reader }, replies))
            }
        }
    }

    fn spawn_command(&self, tasks: &mut JoinSet<()>, command: Envelope, replies: ReplyPath) {
        tracing::debug!(command_id = %command.id, kind = %command.kind, "dispatching command");
        self.set_state(DispatcherState::Dispatching);
        let router = self.router.clone();
        let stale = matches!(replies, ReplyPath::Streams { .. }) && is_stale(&command, Utc::now());
        tasks.spawn(async move {
            let reply = if stale {
                tracing::warn!(command_id = %command.id, kind = %command.kind, issued = %command.timestamp, "refusing stale command");
                Envelope::error_reply(&command, ErrorCode::OperationFailed, "stale command, not executed")
            } else {
                router.dispatch(&command).await
            };
            if let Err(e) = replies.send(&reply).await {
                tracing::error!(command_id = %command.id, error = %e, "failed to send reply");
            }
        });
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        tracing::info!(in_flight = tasks.len(), grace = ?self.grace_period, "waiting for in-flight commands");
        let finished = tokio::time::timeout(self.grace_period, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            tracing::warn!(aborted = tasks.len(), "grace period elapsed, aborting in-flight commands");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
