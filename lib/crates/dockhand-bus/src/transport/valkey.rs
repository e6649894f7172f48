//! Direct Valkey access: pub/sub channels and streams.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands as _;
use tokio::sync::{mpsc, Mutex};

use super::{Cursor, LogEntry, OrderedLog, Subscription, Transport, SUBSCRIPTION_BUFFER};
use crate::error::TransportError;

/// Idle blocking-read connections kept per stream client.
const MAX_IDLE_READERS: usize = 8;

async fn open_connection(
    client: &redis::Client,
) -> Result<MultiplexedConnection, TransportError> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))
}

// ── Pub/sub ───────────────────────────────────────────────────────────────────

/// Pub/sub over a direct broker connection.
///
/// Publishes share one multiplexed connection. Every subscription gets its
/// own dedicated pub/sub connection, so closing one never affects another.
pub struct ValkeyTransport {
    client: redis::Client,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

impl ValkeyTransport {
    /// Connect and verify the broker answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the URL is invalid or the broker
    /// is unreachable.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Connect(e.to_string()))?;
        let mut conn = open_connection(&client).await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!("connected to valkey");
        Ok(Self {
            client,
            conn,
            closed: AtomicBool::new(false),
        })
    }

    /// Ordered-log access over the same broker.
    #[must_use]
    pub fn streams(&self) -> ValkeyStreams {
        ValkeyStreams::new(self.client.clone(), self.conn.clone())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ValkeyTransport {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn
            .publish(destination, payload)
            .await
            .map_err(|e| TransportError::Publish {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let subscribe_err = |e: redis::RedisError| TransportError::Subscribe {
            destination: destination.to_string(),
            reason: e.to_string(),
        };
        let mut pubsub = self.client.get_async_pubsub().await.map_err(subscribe_err)?;
        pubsub.subscribe(destination).await.map_err(subscribe_err)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = destination.to_string();
        let pump = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                if tx.send(msg.get_payload_bytes().to_vec()).await.is_err() {
                    return;
                }
            }
            tracing::warn!(channel = %channel, "broker closed subscription");
        });
        Ok(Subscription::new(destination, rx).with_pump(pump))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Ordered log over Valkey streams.
///
/// Blocking reads stall every request queued on the same multiplexed
/// connection, so they run on a small pool of reader connections.
#[derive(Clone)]
pub struct ValkeyStreams {
    client: redis::Client,
    conn: MultiplexedConnection,
    readers: Arc<Mutex<Vec<MultiplexedConnection>>>,
    max_len: Option<usize>,
}

impl ValkeyStreams {
    fn new(client: redis::Client, conn: MultiplexedConnection) -> Self {
        Self {
            client,
            conn,
            readers: Arc::new(Mutex::new(Vec::new())),
            max_len: None,
        }
    }

    /// Connect directly, without a pub/sub transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the broker is unreachable.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Connect(e.to_string()))?;
        let conn = open_connection(&client).await?;
        Ok(Self::new(client, conn))
    }

    /// Trim streams to roughly `max_len` entries on every append.
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    async fn checkout_reader(&self) -> Result<MultiplexedConnection, TransportError> {
        if let Some(conn) = self.readers.lock().await.pop() {
            return Ok(conn);
        }
        open_connection(&self.client).await
    }

    async fn checkin_reader(&self, conn: MultiplexedConnection) {
        let mut readers = self.readers.lock().await;
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
    }
}

fn string_fields(map: &HashMap<String, redis::Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| redis::from_redis_value::<String>(v).ok().map(|s| (k.clone(), s)))
        .collect()
}

fn to_log_entry(entry: StreamId) -> LogEntry {
    LogEntry {
        fields: string_fields(&entry.map),
        id: entry.id,
    }
}

fn log_err(stream: &str, e: &redis::RedisError) -> TransportError {
    TransportError::Log {
        stream: stream.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl OrderedLog for ValkeyStreams {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
    ) -> Result<String, TransportError> {
        let mut conn = self.conn.clone();
        let id: String = match self.max_len {
            Some(max_len) => conn
                .xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", fields)
                .await
                .map_err(|e| log_err(stream, &e))?,
            None => conn
                .xadd(stream, "*", fields)
                .await
                .map_err(|e| log_err(stream, &e))?,
        };
        Ok(id)
    }

    async fn read_from(
        &self,
        stream: &str,
        cursor: &Cursor,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let mut opts = StreamReadOptions::default().count(max);
        let wait_ms = usize::try_from(wait.as_millis()).unwrap_or(usize::MAX);
        // BLOCK 0 means forever.
        if wait_ms > 0 {
            opts = opts.block(wait_ms);
        }

        let mut conn = self.checkout_reader().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[cursor.as_read_id()], &opts)
            .await
            .map_err(|e| log_err(stream, &e))?;
        self.checkin_reader(conn).await;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(to_log_entry)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tail(&self, stream: &str) -> Result<Cursor, TransportError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| log_err(stream, &e))?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map_or(Cursor::Origin, |entry| Cursor::After(entry.id)))
    }
}

impl std::fmt::Debug for ValkeyStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStreams")
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;

    fn live_url() -> String {
        std::env::var("DOCKHAND_TEST_VALKEY_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[test]
    fn stream_entry_fields_become_strings() {
        let mut map = HashMap::new();
        map.insert("type".to_string(), redis::Value::BulkString(b"ping".to_vec()));
        map.insert("version".to_string(), redis::Value::SimpleString("1.0".to_string()));
        let entry = to_log_entry(StreamId {
            id: "1700000000000-0".to_string(),
            map,
        });
        assert_eq!(entry.id, "1700000000000-0");
        assert_eq!(entry.field("type"), Some("ping"));
        assert_eq!(entry.field("version"), Some("1.0"));
    }

    #[test]
    fn non_string_values_are_skipped() {
        let mut map = HashMap::new();
        map.insert("nested".to_string(), redis::Value::Array(vec![]));
        map.insert("ok".to_string(), redis::Value::BulkString(b"yes".to_vec()));
        let fields = string_fields(&map);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["ok"], "yes");
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let result = ValkeyTransport::connect("not-a-url").await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    #[ignore = "requires live Valkey"]
    async fn live_pubsub_delivers_to_subscriber() {
        let transport = ValkeyTransport::connect(&live_url()).await.unwrap();
        let channel = format!("dockhand-test:{}", uuid::Uuid::new_v4());
        let mut sub = transport.subscribe(&channel).await.unwrap();
        transport.publish(&channel, b"hello").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    #[ignore = "requires live Valkey"]
    async fn live_streams_read_after_tail() {
        let streams = ValkeyStreams::connect(&live_url()).await.unwrap();
        let stream = format!("dockhand-test:{}", uuid::Uuid::new_v4());
        streams.append(&stream, &[("n", "1".to_string())]).await.unwrap();
        let tail = streams.tail(&stream).await.unwrap();
        let id = streams.append(&stream, &[("n", "2".to_string())]).await.unwrap();
        let entries = streams
            .read_from(&stream, &tail, 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].field("n"), Some("2"));
    }
}
