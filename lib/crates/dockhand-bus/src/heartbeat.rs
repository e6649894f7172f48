//! Liveness side-channel on `heartbeat:{server_key}`.
//!
//! Heartbeats are not correlated with commands and never get a reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockhand_common::{heartbeat_channel, HeartbeatPayload, HeartbeatStatus};
use tokio::sync::watch;

use crate::error::TransportError;
use crate::shutdown;
use crate::transport::Transport;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub struct HeartbeatPublisher {
    transport: Arc<dyn Transport>,
    server_key: String,
    server_name: String,
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        server_key: impl Into<String>,
        server_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            server_key: server_key.into(),
            server_name: server_name.into(),
            interval,
        }
    }

    #[must_use]
    pub fn beat(&self, status: HeartbeatStatus) -> HeartbeatPayload {
        HeartbeatPayload {
            server_key: self.server_key.clone(),
            server_name: self.server_name.clone(),
            timestamp: Utc::now(),
            status,
        }
    }

    /// Publish one heartbeat.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] from the publish.
    pub async fn publish(&self, status: HeartbeatStatus) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&self.beat(status)).unwrap_or_default();
        self.transport
            .publish(&heartbeat_channel(&self.server_key), &body)
            .await
    }

    /// Publish `online` every interval until `stop` fires, then one final
    /// `offline`. Publish failures are logged and never end the loop.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown::wait_for(&mut stop) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.publish(HeartbeatStatus::Online).await {
                        tracing::warn!(error = %e, "heartbeat publish failed");
                    }
                }
            }
        }
        match self.publish(HeartbeatStatus::Offline).await {
            Ok(()) => tracing::info!(server = %self.server_name, "published offline heartbeat"),
            Err(e) => tracing::warn!(error = %e, "offline heartbeat publish failed"),
        }
    }
}

/// Parse a message received on a heartbeat channel.
///
/// # Errors
///
/// Returns the JSON error when `bytes` is not a heartbeat payload.
pub fn decode_heartbeat(bytes: &[u8]) -> Result<HeartbeatPayload, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[tokio::test]
    async fn publishes_online_then_offline_on_stop() {
        let broker = Arc::new(MemoryBroker::new());
        let mut sub = broker.subscribe("heartbeat:k").await.unwrap();
        let hb = HeartbeatPublisher::new(broker.clone(), "k", "web-01", Duration::from_millis(10));
        let (stop_tx, stop_rx) = shutdown::channel();
        let runner = tokio::spawn(async move { hb.run(stop_rx).await });

        let first = decode_heartbeat(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(first.status, HeartbeatStatus::Online);
        assert_eq!(first.server_key, "k");
        assert_eq!(first.server_name, "web-01");

        stop_tx.send(true).unwrap();
        runner.await.unwrap();
        let mut last = None;
        while let Some(bytes) = sub.try_recv() {
            last = Some(decode_heartbeat(&bytes).unwrap());
        }
        assert_eq!(last.unwrap().status, HeartbeatStatus::Offline);
    }

    #[tokio::test]
    async fn publish_failures_do_not_stop_the_loop() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_fail_publish(true);
        let hb = HeartbeatPublisher::new(broker.clone(), "k", "web-01", Duration::from_millis(5));
        let (stop_tx, stop_rx) = shutdown::channel();
        let runner = tokio::spawn(async move { hb.run(stop_rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!runner.is_finished());
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn heartbeat_wire_shape() {
        let broker = Arc::new(MemoryBroker::new());
        let hb = HeartbeatPublisher::new(broker, "k", "web-01", DEFAULT_INTERVAL);
        let value = serde_json::to_value(hb.beat(HeartbeatStatus::Online)).unwrap();
        assert_eq!(value["status"], "online");
        assert_eq!(value["server_key"], "k");
        assert!(value["timestamp"].is_string());
    }
}
