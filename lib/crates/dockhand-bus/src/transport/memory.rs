//! In-process broker implementing both [`Transport`] and [`OrderedLog`].
//!
//! Used by tests and by single-process deployments. Pub/sub follows broker
//! semantics: a message published while nobody is subscribed is lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::{Cursor, LogEntry, OrderedLog, Subscription, Transport, SUBSCRIPTION_BUFFER};
use crate::error::TransportError;

#[derive(Default)]
struct Inner {
    subscribers: HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
    published: Vec<(String, Vec<u8>)>,
    streams: HashMap<String, Vec<LogEntry>>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    appended: Notify,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following publish fail until reset.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make every following subscribe fail until reset.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Drop every live subscription, as a broker restart would.
    pub fn disconnect_all(&self) {
        self.lock().subscribers.clear();
    }

    /// Number of live subscriptions on `destination`.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(destination) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Every payload published on `destination` so far, oldest first.
    pub fn published(&self, destination: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Every entry currently retained in `stream`.
    pub fn entries(&self, stream: &str) -> Vec<LogEntry> {
        self.lock().streams.get(stream).cloned().unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn entries_after(&self, stream: &str, cursor: &Cursor, max: usize) -> Vec<LogEntry> {
        let after = match cursor {
            Cursor::Origin => (0, 0),
            Cursor::After(id) => parse_entry_id(id),
        };
        self.lock()
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| parse_entry_id(&entry.id) > after)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Split a `{millis}-{seq}` entry id; unparsable parts sort first.
fn parse_entry_id(id: &str) -> (u64, u64) {
    let (major, minor) = id.split_once('-').unwrap_or((id, "0"));
    (major.parse().unwrap_or(0), minor.parse().unwrap_or(0))
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                destination: destination.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }
        let mut inner = self.lock();
        inner
            .published
            .push((destination.to_string(), payload.to_vec()));
        if let Some(senders) = inner.subscribers.get_mut(destination) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                if tx.try_send(payload.to_vec()).is_err() {
                    tracing::warn!(destination, "subscriber queue full, message dropped");
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe {
                destination: destination.to_string(),
                reason: "injected subscribe failure".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock()
            .subscribers
            .entry(destination.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(destination, rx))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect_all();
        Ok(())
    }
}

#[async_trait]
impl OrderedLog for MemoryBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
    ) -> Result<String, TransportError> {
        self.ensure_open()?;
        let id = {
            let mut inner = self.lock();
            inner.next_seq += 1;
            let id = format!("{}-0", inner.next_seq);
            let entry = LogEntry {
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect::<BTreeMap<_, _>>(),
            };
            inner.streams.entry(stream.to_string()).or_default().push(entry);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_from(
        &self,
        stream: &str,
        cursor: &Cursor,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogEntry>, TransportError> {
        self.ensure_open()?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Registered before the check so an append in between still wakes us.
            let notified = self.appended.notified();
            let entries = self.entries_after(stream, cursor, max);
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn tail(&self, stream: &str) -> Result<Cursor, TransportError> {
        self.ensure_open()?;
        Ok(self
            .lock()
            .streams
            .get(stream)
            .and_then(|entries| entries.last())
            .map_or(Cursor::Origin, |entry| Cursor::After(entry.id.clone())))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("cmd:k").await.unwrap();
        let mut b = broker.subscribe("cmd:k").await.unwrap();
        broker.publish("cmd:k", b"hello").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"hello");
        assert_eq!(b.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_recorded_but_lost() {
        let broker = MemoryBroker::new();
        broker.publish("cmd:k", b"early").await.unwrap();
        let mut sub = broker.subscribe("cmd:k").await.unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(broker.published("cmd:k"), vec![b"early".to_vec()]);
    }

    #[tokio::test]
    async fn disconnect_closes_subscriptions() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("resp:k").await.unwrap();
        broker.disconnect_all();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_subscription_is_pruned() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("resp:k").await.unwrap();
        assert_eq!(broker.subscriber_count("resp:k"), 1);
        sub.close();
        assert_eq!(broker.subscriber_count("resp:k"), 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let broker = MemoryBroker::new();
        broker.set_fail_subscribe(true);
        assert!(matches!(
            broker.subscribe("x").await,
            Err(TransportError::Subscribe { .. })
        ));
        broker.set_fail_publish(true);
        assert!(matches!(
            broker.publish("x", b"").await,
            Err(TransportError::Publish { .. })
        ));
    }

    #[tokio::test]
    async fn closed_broker_rejects_operations() {
        let broker = MemoryBroker::new();
        Transport::close(&broker).await.unwrap();
        assert!(matches!(
            broker.publish("x", b"").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn read_from_waits_for_append() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let writer = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", &[("k", "v".to_string())]).await.unwrap()
        });
        let entries = broker
            .read_from("s", &Cursor::Origin, 10, Duration::from_secs(5))
            .await
            .unwrap();
        let id = handle.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].field("k"), Some("v"));
    }

    #[tokio::test]
    async fn read_from_times_out_empty() {
        let broker = MemoryBroker::new();
        let entries = broker
            .read_from("s", &Cursor::Origin, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn tail_points_after_newest_entry() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.tail("s").await.unwrap(), Cursor::Origin);
        broker.append("s", &[]).await.unwrap();
        let last = broker.append("s", &[]).await.unwrap();
        assert_eq!(broker.tail("s").await.unwrap(), Cursor::After(last));
    }

    #[test]
    fn entry_ids_compare_numerically() {
        assert!(parse_entry_id("10-0") > parse_entry_id("9-0"));
        assert!(parse_entry_id("5-1") > parse_entry_id("5-0"));
        assert_eq!(parse_entry_id("garbage"), (0, 0));
    }
}
