//! Periodic host metric collection into the fan-out publisher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockhand_bus::{shutdown, MetricPublisher, MetricsSource};
use dockhand_common::MetricSample;
use tokio::sync::watch;

pub struct MetricsReporter {
    source: Arc<dyn MetricsSource>,
    publisher: MetricPublisher,
    server_key: String,
    server_name: String,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        publisher: MetricPublisher,
        server_key: impl Into<String>,
        server_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            publisher,
            server_key: server_key.into(),
            server_name: server_name.into(),
            interval,
        }
    }

    fn sample(&self, name: &str, value: f64, unit: &str) -> MetricSample {
        MetricSample {
            server_key: self.server_key.clone(),
            server_name: self.server_name.clone(),
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: Utc::now(),
            labels: BTreeMap::new(),
        }
    }

    /// One reading of every metric. A failing reading is skipped.
    #[allow(clippy::cast_precision_loss)]
    pub async fn collect(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        match self.source.memory().await {
            Ok(memory) => {
                samples.push(self.sample("memory.used_percent", memory.used_percent, "percent"));
                samples.push(self.sample("memory.used_bytes", memory.used_bytes as f64, "bytes"));
            }
            Err(e) => tracing::debug!(error = %e, "memory reading unavailable"),
        }

        match self.source.disks().await {
            Ok(disks) => {
                for disk in disks {
                    let mut sample = self.sample("disk.used_percent", disk.used_percent, "percent");
                    sample.labels.insert("mount".to_string(), disk.mount_point);
                    samples.push(sample);
                }
            }
            Err(e) => tracing::debug!(error = %e, "disk reading unavailable"),
        }

        match self.source.uptime().await {
            Ok(uptime) => {
                samples.push(self.sample("uptime.seconds", uptime.uptime_seconds as f64, "seconds"));
            }
            Err(e) => tracing::debug!(error = %e, "uptime reading unavailable"),
        }

        match self.source.temperature().await {
            Ok(reading) => {
                let mut sample = self.sample("temperature.celsius", reading.temperature, "celsius");
                sample.labels.insert("sensor".to_string(), reading.sensor);
                samples.push(sample);
            }
            Err(e) => tracing::debug!(error = %e, "temperature reading unavailable"),
        }

        samples
    }

    /// Collect and publish once. Returns how many samples were accepted.
    pub async fn report_once(&self) -> usize {
        let mut accepted = 0;
        for sample in self.collect().await {
            match self.publisher.publish(&sample).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(metric = %sample.name, error = %e, "metric publish failed");
                }
            }
        }
        accepted
    }

    /// Report every interval until `stop` fires, then close the publisher.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            destinations = ?self.publisher.destination_names(),
            "metrics reporter started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown::wait_for(&mut stop) => break,
                _ = ticker.tick() => {
                    let accepted = self.report_once().await;
                    tracing::debug!(accepted, "metrics reported");
                }
            }
        }
        if let Err(e) = self.publisher.close().await {
            tracing::warn!(error = %e, "closing metric destinations failed");
        }
    }
}
