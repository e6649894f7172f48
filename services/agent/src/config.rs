//! Agent configuration from `DOCKHAND_AGENT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dockhand_common::{validate_server_key, TransportMode};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "DOCKHAND_AGENT_";

/// Each field maps to `DOCKHAND_AGENT_<FIELD>`:
///   - `SERVER_KEY`              (required)
///   - `SERVER_NAME`             (default: host name, else the key)
///   - `MODE`                    (`pubsub` | `streams` | `http`, default `pubsub`)
///   - `VALKEY_URL`              (default `redis://valkey:6379`)
///   - `RELAY_URL`               (required in `http` mode)
///   - `RELAY_TOKEN`             (optional)
///   - `HEARTBEAT_INTERVAL_SECS` (default 30)
///   - `METRICS_INTERVAL_SECS`   (default 60)
///   - `METRICS_CONFIG`          (optional path to `metrics.yaml`)
///   - `GRACE_PERIOD_SECS`       (default 10)
///   - `STREAM_MAX_LEN`          (optional approximate trim length)
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub server_key: String,

    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub mode: TransportMode,

    #[serde(default = "dockhand_common::config::default_valkey_url")]
    pub valkey_url: String,

    #[serde(default)]
    pub relay_url: Option<String>,

    #[serde(default)]
    pub relay_token: Option<String>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    #[serde(default)]
    pub metrics_config: Option<PathBuf>,

    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default)]
    pub stream_max_len: Option<usize>,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_grace_period_secs() -> u64 {
    10
}

impl AgentConfig {
    /// # Errors
    ///
    /// Returns an error if a variable is missing or malformed, or the
    /// settings are inconsistent.
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .context("failed to load config from DOCKHAND_AGENT_* env vars (DOCKHAND_AGENT_SERVER_KEY is required)")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Same as [`AgentConfig::from_env`], reading `vars` instead.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .context("invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error for an invalid server key, an `http` mode without a
    /// relay URL, or a zero interval.
    pub fn validate(&self) -> Result<()> {
        validate_server_key(&self.server_key)
            .map_err(|reason| anyhow::anyhow!("invalid server key: {reason}"))?;
        if self.mode == TransportMode::Http && self.relay_url.is_none() {
            anyhow::bail!("DOCKHAND_AGENT_RELAY_URL is required in http mode");
        }
        anyhow::ensure!(self.heartbeat_interval_secs > 0, "heartbeat interval must be positive");
        anyhow::ensure!(self.metrics_interval_secs > 0, "metrics interval must be positive");
        Ok(())
    }

    /// Configured name, else the host name, else the key.
    pub fn resolved_server_name(&self) -> String {
        self.server_name
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| self.server_key.clone())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply() {
        let config = AgentConfig::from_vars(vars(&[("SERVER_KEY", "a1b2c3")])).unwrap();
        assert_eq!(config.mode, TransportMode::Pubsub);
        assert_eq!(config.valkey_url, "redis://valkey:6379");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.metrics_interval(), Duration::from_secs(60));
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert!(config.metrics_config.is_none());
    }

    #[test]
    fn parses_streams_mode_and_overrides() {
        let config = AgentConfig::from_vars(vars(&[
            ("SERVER_KEY", "a1b2c3"),
            ("SERVER_NAME", "web-01"),
            ("MODE", "streams"),
            ("METRICS_CONFIG", "/etc/dockhand/metrics.yaml"),
            ("STREAM_MAX_LEN", "5000"),
        ]))
        .unwrap();
        assert_eq!(config.mode, TransportMode::Streams);
        assert_eq!(config.resolved_server_name(), "web-01");
        assert_eq!(config.stream_max_len, Some(5000));
    }

    #[test]
    fn missing_key_is_an_error() {
        assert!(AgentConfig::from_vars(vars(&[("MODE", "pubsub")])).is_err());
    }

    #[test]
    fn bad_key_is_rejected() {
        assert!(AgentConfig::from_vars(vars(&[("SERVER_KEY", "has:colon")])).is_err());
    }

    #[test]
    fn http_mode_needs_relay_url() {
        assert!(AgentConfig::from_vars(vars(&[("SERVER_KEY", "k"), ("MODE", "http")])).is_err());
        let config = AgentConfig::from_vars(vars(&[
            ("SERVER_KEY", "k"),
            ("MODE", "http"),
            ("RELAY_URL", "https://relay.example.com"),
        ]))
        .unwrap();
        assert_eq!(config.relay_url.as_deref(), Some("https://relay.example.com"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(AgentConfig::from_vars(vars(&[
            ("SERVER_KEY", "k"),
            ("HEARTBEAT_INTERVAL_SECS", "0")
        ]))
        .is_err());
    }
}
