//! Metric destinations.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockhand_common::MetricSample;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::Mutex;

use super::MetricSink;
use crate::error::SinkError;
use crate::transport::OrderedLog;

// ── Log ───────────────────────────────────────────────────────────────────────

/// Emits each sample as a structured `tracing` event.
pub struct LogSink {
    name: String,
    topic: String,
}

impl LogSink {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            name: format!("log:{topic}"),
            topic,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl MetricSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, sample: &MetricSample) -> Result<(), SinkError> {
        tracing::info!(
            target: "dockhand::metrics",
            topic = %self.topic,
            metric = %sample.name,
            value = sample.value,
            unit = %sample.unit,
            server = %sample.server_name,
            "metric sample"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

// ── Valkey stream ─────────────────────────────────────────────────────────────

/// Appends each sample to an ordered log as flat fields.
pub struct ValkeyStreamSink {
    name: String,
    log: Arc<dyn OrderedLog>,
    stream: String,
}

impl ValkeyStreamSink {
    pub fn new(log: Arc<dyn OrderedLog>, stream: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            name: format!("valkey-stream:{stream}"),
            log,
            stream,
        }
    }
}

fn sample_fields(sample: &MetricSample) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("name", sample.name.clone()),
        ("value", sample.value.to_string()),
        ("unit", sample.unit.clone()),
        ("timestamp", sample.timestamp.to_rfc3339()),
        ("server_key", sample.server_key.clone()),
        ("server_name", sample.server_name.clone()),
    ];
    if !sample.labels.is_empty() {
        fields.push((
            "labels",
            serde_json::to_string(&sample.labels).unwrap_or_default(),
        ));
    }
    fields
}

#[async_trait]
impl MetricSink for ValkeyStreamSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, sample: &MetricSample) -> Result<(), SinkError> {
        self.log
            .append(&self.stream, &sample_fields(sample))
            .await
            .map(|_| ())
            .map_err(|e| SinkError::failed(&self.name, e))
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

// ── HTTP batch ────────────────────────────────────────────────────────────────

/// Failed batches kept for the next flush, in multiples of the batch size.
const RETAINED_BATCHES: usize = 10;

/// Buffers samples and `POST`s them as a JSON array once `batch_size` are
/// queued, and on close.
///
/// A failed flush goes back to the front of the buffer and is retried with
/// the next full batch. At most `RETAINED_BATCHES` batches are held; beyond
/// that the oldest samples are dropped. Samples still unsent when a final
/// flush on close fails are lost.
pub struct HttpBatchSink {
    name: String,
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    gzip: bool,
    batch_size: usize,
    buffer: Mutex<Vec<MetricSample>>,
    closed: AtomicBool,
}

impl HttpBatchSink {
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        gzip: bool,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Config(e.to_string()))?;
        Ok(Self {
            name: format!("http:{url}"),
            client,
            url,
            token,
            gzip,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, batch: &[MetricSample]) -> Result<(), SinkError> {
        let body = serde_json::to_vec(batch).map_err(|e| SinkError::failed(&self.name, e))?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        let body = if self.gzip {
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
            gzip(&body).map_err(|e| SinkError::failed(&self.name, e))?
        } else {
            body
        };
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::failed(&self.name, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::failed(&self.name, format!("HTTP {status}")));
        }
        tracing::debug!(destination = %self.name, samples = batch.len(), "metric batch sent");
        Ok(())
    }

    /// Put an unsent batch back ahead of anything queued since.
    async fn requeue(&self, mut batch: Vec<MetricSample>) {
        let mut buffer = self.buffer.lock().await;
        batch.append(&mut buffer);
        let cap = self.batch_size.saturating_mul(RETAINED_BATCHES);
        if batch.len() > cap {
            let dropped = batch.len() - cap;
            batch.drain(..dropped);
            tracing::warn!(destination = %self.name, dropped, "metric buffer full, dropping oldest samples");
        }
        *buffer = batch;
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[async_trait]
impl MetricSink for HttpBatchSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, sample: &MetricSample) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed(self.name.clone()));
        }
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(sample.clone());
            if buffer.len() < self.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        let result = self.send(&batch).await;
        if result.is_err() {
            self.requeue(batch).await;
        }
        result
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        self.send(&batch).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use chrono::Utc;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read as _;

    fn sample(name: &str) -> MetricSample {
        MetricSample {
            server_key: "k".to_string(),
            server_name: "web-01".to_string(),
            name: name.to_string(),
            value: 1.5,
            unit: "percent".to_string(),
            timestamp: Utc::now(),
            labels: BTreeMap::from([("mount".to_string(), "/".to_string())]),
        }
    }

    #[test]
    fn gzip_output_decompresses() {
        let packed = gzip(b"[1,2,3]").unwrap();
        let mut text = String::new();
        GzDecoder::new(&packed[..]).read_to_string(&mut text).unwrap();
        assert_eq!(text, "[1,2,3]");
    }

    #[tokio::test]
    async fn stream_sink_appends_flat_fields() {
        let broker = Arc::new(MemoryBroker::new());
        let sink = ValkeyStreamSink::new(broker.clone(), "metrics:k");
        sink.publish(&sample("disk.used_percent")).await.unwrap();
        let entries = broker.entries("metrics:k");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("name"), Some("disk.used_percent"));
        assert_eq!(entries[0].field("value"), Some("1.5"));
        assert_eq!(entries[0].field("labels"), Some(r#"{"mount":"/"}"#));
    }

    #[tokio::test]
    async fn stream_sink_surfaces_log_errors() {
        let broker = Arc::new(MemoryBroker::new());
        crate::Transport::close(broker.as_ref()).await.unwrap();
        let sink = ValkeyStreamSink::new(broker, "metrics:k");
        assert!(matches!(
            sink.publish(&sample("x")).await,
            Err(SinkError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn log_sink_always_succeeds() {
        let sink = LogSink::new("metrics.web-01");
        assert_eq!(sink.name(), "log:metrics.web-01");
        sink.publish(&sample("uptime.seconds")).await.unwrap();
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn http_sink_buffers_below_batch_size() {
        // Unroutable endpoint: any send would fail.
        let sink = HttpBatchSink::new("http://127.0.0.1:9/ingest", None, false, 3, Duration::from_millis(200))
            .unwrap();
        sink.publish(&sample("a")).await.unwrap();
        sink.publish(&sample("b")).await.unwrap();
        assert!(sink.publish(&sample("c")).await.is_err());
    }

    #[tokio::test]
    async fn http_sink_keeps_failed_batch_for_retry() {
        let sink = HttpBatchSink::new("http://127.0.0.1:9/ingest", None, false, 2, Duration::from_millis(200))
            .unwrap();
        sink.publish(&sample("a")).await.unwrap();
        assert!(sink.publish(&sample("b")).await.is_err());
        let names: Vec<_> = sink.buffer.lock().await.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn http_sink_retention_drops_oldest_first() {
        let sink = HttpBatchSink::new("http://127.0.0.1:9/ingest", None, false, 1, Duration::from_millis(200))
            .unwrap();
        for n in 0..15 {
            assert!(sink.publish(&sample(&format!("s{n}"))).await.is_err());
        }
        let buffer = sink.buffer.lock().await;
        assert_eq!(buffer.len(), RETAINED_BATCHES);
        assert_eq!(buffer[0].name, "s5");
        assert_eq!(buffer[RETAINED_BATCHES - 1].name, "s14");
    }

    #[tokio::test]
    async fn http_sink_close_flushes_remainder() {
        let sink = HttpBatchSink::new("http://127.0.0.1:9/ingest", None, true, 10, Duration::from_millis(200))
            .unwrap();
        sink.publish(&sample("a")).await.unwrap();
        assert!(sink.close().await.is_err());
        assert!(matches!(
            sink.publish(&sample("b")).await,
            Err(SinkError::Closed(_))
        ));
    }
}
