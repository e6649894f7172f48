//! `metrics.yaml`: fan-out policy and the ordered destination list.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sinks::{HttpBatchSink, LogSink, ValkeyStreamSink};
use super::{FanoutPolicy, MetricPublisher, MetricSink};
use crate::error::SinkError;
use crate::transport::valkey::ValkeyStreams;
use crate::transport::OrderedLog;

fn default_stream() -> String {
    "metrics:{server_key}".to_string()
}

fn default_max_len() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    50
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_topic() -> String {
    "metrics.{server_name}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DestinationConfig {
    ValkeyStream {
        /// Broker URL; the agent's own broker when absent.
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_stream")]
        stream: String,
        #[serde(default = "default_max_len")]
        max_len: usize,
    },
    Http {
        url: String,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        #[serde(default)]
        gzip: bool,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Log {
        #[serde(default = "default_topic")]
        topic: String,
    },
}

impl DestinationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValkeyStream { .. } => "valkey-stream",
            Self::Http { .. } => "http",
            Self::Log { .. } => "log",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanoutConfig {
    #[serde(default)]
    pub policy: FanoutPolicy,
    pub destinations: Vec<DestinationConfig>,
}

/// Values substituted into destination templates at build time.
#[derive(Clone)]
pub struct SinkContext {
    pub server_key: String,
    pub server_name: String,
    pub valkey_url: String,
    /// Log reused by `valkey-stream` destinations without their own `url`.
    pub log: Option<Arc<dyn OrderedLog>>,
}

impl SinkContext {
    pub fn new(
        server_key: impl Into<String>,
        server_name: impl Into<String>,
        valkey_url: impl Into<String>,
    ) -> Self {
        Self {
            server_key: server_key.into(),
            server_name: server_name.into(),
            valkey_url: valkey_url.into(),
            log: None,
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: Arc<dyn OrderedLog>) -> Self {
        self.log = Some(log);
        self
    }

    fn expand(&self, template: &str) -> String {
        expand_template(template, &self.server_key, &self.server_name)
    }
}

/// Replace `{server_key}` and `{server_name}` in `template`.
#[must_use]
pub fn expand_template(template: &str, server_key: &str, server_name: &str) -> String {
    template
        .replace("{server_key}", server_key)
        .replace("{server_name}", server_name)
}

impl FanoutConfig {
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] on malformed YAML or an empty
    /// destination list.
    pub fn from_yaml(text: &str) -> Result<Self, SinkError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| SinkError::Config(e.to_string()))?;
        if config.destinations.is_empty() {
            return Err(SinkError::Config("destinations must not be empty".to_string()));
        }
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`SinkError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, SinkError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SinkError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Single `log` destination, used when no file is configured.
    pub fn log_only() -> Self {
        Self {
            policy: FanoutPolicy::default(),
            destinations: vec![DestinationConfig::Log {
                topic: default_topic(),
            }],
        }
    }

    /// Instantiate every destination in order.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Config`] if a destination cannot be set up,
    /// including an unreachable broker for `valkey-stream`.
    pub async fn build(&self, ctx: &SinkContext) -> Result<MetricPublisher, SinkError> {
        let mut sinks: Vec<Box<dyn MetricSink>> = Vec::with_capacity(self.destinations.len());
        for destination in &self.destinations {
            let sink: Box<dyn MetricSink> = match destination {
                DestinationConfig::ValkeyStream { url, stream, max_len } => {
                    let log: Arc<dyn OrderedLog> = match (url, &ctx.log) {
                        (None, Some(shared)) => Arc::clone(shared),
                        _ => {
                            let url = url.as_deref().unwrap_or(&ctx.valkey_url);
                            let streams = ValkeyStreams::connect(url)
                                .await
                                .map_err(|e| SinkError::Config(format!("valkey-stream: {e}")))?;
                            Arc::new(streams.with_max_len(*max_len))
                        }
                    };
                    Box::new(ValkeyStreamSink::new(log, ctx.expand(stream)))
                }
                DestinationConfig::Http {
                    url,
                    batch_size,
                    gzip,
                    token,
                    timeout_secs,
                } => Box::new(HttpBatchSink::new(
                    url.clone(),
                    token.clone(),
                    *gzip,
                    *batch_size,
                    Duration::from_secs(*timeout_secs),
                )?),
                DestinationConfig::Log { topic } => Box::new(LogSink::new(ctx.expand(topic))),
            };
            tracing::debug!(kind = destination.kind(), destination = sink.name(), "metric destination ready");
            sinks.push(sink);
        }
        MetricPublisher::new(sinks, self.policy)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use chrono::Utc;
    use dockhand_common::MetricSample;
    use std::io::Write as _;

    const FULL: &str = r"
policy: fail-if-primary-fails
destinations:
  - kind: valkey-stream
  - kind: http
    url: https://ingest.example.com/v1/metrics
    batch_size: 20
    gzip: true
    token: s3cret
  - kind: log
    topic: audit.{server_name}
";

    #[test]
    fn parses_every_destination_kind_with_defaults() {
        let config = FanoutConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.policy, FanoutPolicy::FailIfPrimaryFails);
        assert_eq!(
            config.destinations[0],
            DestinationConfig::ValkeyStream {
                url: None,
                stream: "metrics:{server_key}".to_string(),
                max_len: 10_000,
            }
        );
        match &config.destinations[1] {
            DestinationConfig::Http {
                batch_size,
                gzip,
                token,
                timeout_secs,
                ..
            } => {
                assert_eq!(*batch_size, 20);
                assert!(*gzip);
                assert_eq!(token.as_deref(), Some("s3cret"));
                assert_eq!(*timeout_secs, 10);
            }
            other => panic!("expected http, got {other:?}"),
        }
        assert_eq!(config.destinations[2].kind(), "log");
    }

    #[test]
    fn policy_defaults_when_omitted() {
        let config = FanoutConfig::from_yaml("destinations:\n  - kind: log\n").unwrap();
        assert_eq!(config.policy, FanoutPolicy::FailIfPrimaryFails);
    }

    #[test]
    fn rejects_empty_and_unknown() {
        assert!(FanoutConfig::from_yaml("destinations: []\n").is_err());
        assert!(FanoutConfig::from_yaml("destinations:\n  - kind: carrier-pigeon\n").is_err());
        assert!(FanoutConfig::from_yaml("policy: best-effort\ndestinations:\n  - kind: log\n").is_err());
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = FanoutConfig::from_file(file.path()).unwrap();
        assert_eq!(config.destinations.len(), 3);
        assert!(FanoutConfig::from_file(Path::new("/nonexistent/metrics.yaml")).is_err());
    }

    #[test]
    fn templates_expand_both_placeholders() {
        assert_eq!(
            expand_template("m:{server_key}:{server_name}", "abc", "web-01"),
            "m:abc:web-01"
        );
        assert_eq!(expand_template("plain", "abc", "web-01"), "plain");
    }

    #[tokio::test]
    async fn builds_in_order_against_shared_log() {
        let broker = Arc::new(MemoryBroker::new());
        let config = FanoutConfig::from_yaml(
            "destinations:\n  - kind: valkey-stream\n  - kind: log\n",
        )
        .unwrap();
        let ctx = SinkContext::new("abc", "web-01", "redis://unused").with_log(broker.clone());
        let publisher = config.build(&ctx).await.unwrap();
        assert_eq!(
            publisher.destination_names(),
            vec!["valkey-stream:metrics:abc", "log:metrics.web-01"]
        );

        let sample = MetricSample {
            server_key: "abc".to_string(),
            server_name: "web-01".to_string(),
            name: "uptime.seconds".to_string(),
            value: 12.0,
            unit: "seconds".to_string(),
            timestamp: Utc::now(),
            labels: std::collections::BTreeMap::new(),
        };
        publisher.publish(&sample).await.unwrap();
        assert_eq!(broker.entries("metrics:abc").len(), 1);
    }

    #[tokio::test]
    async fn log_only_needs_no_broker() {
        let ctx = SinkContext::new("abc", "web-01", "redis://unused");
        let publisher = FanoutConfig::log_only().build(&ctx).await.unwrap();
        assert_eq!(publisher.destination_names(), vec!["log:metrics.web-01"]);
    }
}
