//! Broker access.
//!
//! [`Transport`] is the pub/sub contract shared by the direct Valkey
//! connection, the HTTP tunnel and the in-memory broker. [`OrderedLog`] is the
//! append/read-from-cursor contract of streams mode; it is not wire-compatible
//! with pub/sub. A host connection uses exactly one of them, picked once as a
//! [`Link`].

pub mod http;
pub mod memory;
pub mod valkey;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockhand_common::ReplyRoute;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;

pub use http::HttpTransport;
pub use memory::MemoryBroker;
pub use valkey::{ValkeyStreams, ValkeyTransport};

/// Capacity of the local queue behind every subscription.
pub const SUBSCRIPTION_BUFFER: usize = 256;

// ── Pub/sub ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` on `destination`.
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Start receiving messages published on `destination`.
    ///
    /// Connection failures are returned here. Once this returns, a broker
    /// disconnect only closes the subscription.
    async fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError>;

    /// Stop accepting new operations.
    async fn close(&self) -> Result<(), TransportError>;
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Independent receive queue for one destination.
///
/// A background pump feeds the queue; [`Subscription::recv`] returns `None`
/// once the pump has stopped, which callers treat as "no more messages".
pub struct Subscription {
    destination: String,
    rx: mpsc::Receiver<Vec<u8>>,
    pump: Option<JoinHandle<()>>,
    on_close: Option<CloseHook>,
}

impl Subscription {
    pub fn new(destination: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            destination: destination.into(),
            rx,
            pump: None,
            on_close: None,
        }
    }

    /// Attach the task feeding this subscription; it is aborted on close.
    #[must_use]
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Run `hook` once when the subscription is closed or dropped.
    #[must_use]
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.rx.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

// ── Ordered log ───────────────────────────────────────────────────────────────

/// Read position in an ordered log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Before the first retained entry.
    Origin,
    /// After the entry with this id.
    After(String),
}

impl Cursor {
    /// Id to pass to `XREAD`.
    #[must_use]
    pub fn as_read_id(&self) -> &str {
        match self {
            Cursor::Origin => "0",
            Cursor::After(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Id assigned by the log on append.
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait OrderedLog: Send + Sync {
    /// Append an entry and return the id the log assigned to it.
    async fn append(&self, stream: &str, fields: &[(&str, String)])
        -> Result<String, TransportError>;

    /// Up to `max` entries after `cursor`, waiting up to `wait` for the first
    /// one. An empty result means nothing arrived in time.
    async fn read_from(
        &self,
        stream: &str,
        cursor: &Cursor,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogEntry>, TransportError>;

    /// Cursor positioned after the newest entry, so a later read only sees
    /// entries appended from now on.
    async fn tail(&self, stream: &str) -> Result<Cursor, TransportError>;
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// Calling convention for one host connection, fixed at setup.
#[derive(Clone)]
pub enum Link {
    /// Pub/sub channels. `route` is the reply convention used when issuing
    /// commands; agents answer on whatever route each command names.
    PubSub {
        transport: Arc<dyn Transport>,
        route: ReplyRoute,
    },
    /// Ordered-log streams.
    Streams(Arc<dyn OrderedLog>),
}

impl Link {
    pub fn pubsub(transport: Arc<dyn Transport>) -> Self {
        Link::PubSub {
            transport,
            route: ReplyRoute::Broadcast,
        }
    }

    #[must_use]
    pub fn with_route(self, route: ReplyRoute) -> Self {
        match self {
            Link::PubSub { transport, .. } => Link::PubSub { transport, route },
            streams @ Link::Streams(_) => streams,
        }
    }

    /// Reply convention stamped on commands issued over this link.
    pub fn reply_route(&self) -> ReplyRoute {
        match self {
            Link::PubSub { route, .. } => *route,
            Link::Streams(_) => ReplyRoute::Broadcast,
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Link::PubSub { .. } => "pubsub",
            Link::Streams(_) => "streams",
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn cursor_read_ids() {
        assert_eq!(Cursor::Origin.as_read_id(), "0");
        assert_eq!(Cursor::After("5-0".to_string()).as_read_id(), "5-0");
    }

    #[tokio::test]
    async fn subscription_recv_returns_none_after_sender_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new("cmd:k", rx);
        tx.send(b"one".to_vec()).await.unwrap();
        drop(tx);
        assert_eq!(sub.recv().await.as_deref(), Some(&b"one"[..]));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscription_close_runs_hook_once_and_aborts_pump() {
        let (tx, rx) = mpsc::channel(4);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let pump = tokio::spawn(async move {
            let _keep = tx;
            std::future::pending::<()>().await;
        });
        let sub = Subscription::new("cmd:k", rx)
            .with_pump(pump)
            .on_close(move || flag.store(true, Ordering::SeqCst));
        sub.close();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_subscription_runs_hook() {
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(4);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        drop(Subscription::new("cmd:k", rx).on_close(move || flag.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn link_with_route_only_affects_pubsub() {
        let broker: Arc<dyn Transport> = Arc::new(MemoryBroker::new());
        let link = Link::pubsub(broker).with_route(ReplyRoute::PerCommand);
        assert!(matches!(
            link,
            Link::PubSub {
                route: ReplyRoute::PerCommand,
                ..
            }
        ));
        let log: Arc<dyn OrderedLog> = Arc::new(MemoryBroker::new());
        assert_eq!(Link::Streams(log).with_route(ReplyRoute::PerCommand).mode_name(), "streams");
    }
}
