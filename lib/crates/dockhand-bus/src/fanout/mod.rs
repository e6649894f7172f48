//! Metric fan-out: one sample, an ordered list of destinations.
//!
//! The first destination is the primary. Its failure fails the publish;
//! failures of the others are logged and skipped.

mod config;
mod sinks;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dockhand_common::MetricSample;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;

pub use config::{expand_template, DestinationConfig, FanoutConfig, SinkContext};
pub use sinks::{HttpBatchSink, LogSink, ValkeyStreamSink};

/// Partial-failure policy of a destination set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FanoutPolicy {
    /// The first destination must succeed; later ones are best effort.
    #[default]
    FailIfPrimaryFails,
}

#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Short label used in logs and errors.
    fn name(&self) -> &str;

    async fn publish(&self, sample: &MetricSample) -> Result<(), SinkError>;

    /// Flush anything buffered and release resources.
    async fn close(&self) -> Result<(), SinkError>;
}

/// Immutable destination set built once at startup.
pub struct MetricPublisher {
    sinks: Vec<Box<dyn MetricSink>>,
    policy: FanoutPolicy,
    closed: AtomicBool,
}

impl MetricPublisher {
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] when `sinks` is empty.
    pub fn new(sinks: Vec<Box<dyn MetricSink>>, policy: FanoutPolicy) -> Result<Self, SinkError> {
        if sinks.is_empty() {
            return Err(SinkError::Config("at least one destination is required".to_string()));
        }
        Ok(Self {
            sinks,
            policy,
            closed: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> FanoutPolicy {
        self.policy
    }

    pub fn destination_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Send `sample` to every destination in order.
    ///
    /// # Errors
    ///
    /// Returns the primary destination's error, or [`SinkError::Closed`]
    /// after [`MetricPublisher::close`].
    pub async fn publish(&self, sample: &MetricSample) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed("publisher".to_string()));
        }
        let mut sinks = self.sinks.iter();
        if let Some(primary) = sinks.next() {
            primary.publish(sample).await?;
        }
        for sink in sinks {
            if let Err(e) = sink.publish(sample).await {
                tracing::warn!(destination = sink.name(), metric = %sample.name, error = %e, "secondary metric destination failed");
            }
        }
        Ok(())
    }

    /// Close every destination, even after a failure.
    ///
    /// # Errors
    ///
    /// Returns the first close error encountered.
    pub async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                tracing::warn!(destination = sink.name(), error = %e, "metric destination close failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
