//! dockhand agent entry point.
//!
//! Initialises tracing, loads configuration from `DOCKHAND_AGENT_*`
//! environment variables, connects in the configured mode and runs the
//! dispatcher with heartbeat and metric reporting alongside.

use std::sync::Arc;

use anyhow::{Context, Result};
use dockhand_agent::{AgentConfig, DockerContainers, HostMetrics, MetricsReporter, SelfUpdater};
use dockhand_bus::fanout::SinkContext;
use dockhand_bus::transport::{HttpTransport, ValkeyTransport};
use dockhand_bus::{
    shutdown, CommandRouter, Dispatcher, FanoutConfig, HeartbeatPublisher, Link, OrderedLog,
    Transport, TransportError,
};
use dockhand_common::TransportMode;
use tracing_subscriber::EnvFilter;

// ===================================================================
// Connection
// ===================================================================

/// What the configured mode gives the agent to work with.
struct Connection {
    link: Link,
    /// Pub/sub path for heartbeats, which are never stream entries.
    beacon: Arc<dyn Transport>,
    /// Log shared with `valkey-stream` metric destinations.
    log: Option<Arc<dyn OrderedLog>>,
}

async fn connect(config: &AgentConfig) -> Result<Connection> {
    match config.mode {
        TransportMode::Pubsub => {
            let valkey: Arc<dyn Transport> = Arc::new(
                ValkeyTransport::connect(&config.valkey_url)
                    .await
                    .context("failed to connect to Valkey")?,
            );
            Ok(Connection {
                link: Link::pubsub(valkey.clone()),
                beacon: valkey,
                log: None,
            })
        }
        TransportMode::Streams => {
            let valkey = ValkeyTransport::connect(&config.valkey_url)
                .await
                .context("failed to connect to Valkey")?;
            let streams = match config.stream_max_len {
                Some(max_len) => valkey.streams().with_max_len(max_len),
                None => valkey.streams(),
            };
            let log: Arc<dyn OrderedLog> = Arc::new(streams);
            Ok(Connection {
                link: Link::Streams(log.clone()),
                beacon: Arc::new(valkey),
                log: Some(log),
            })
        }
        TransportMode::Http => {
            let relay_url = config
                .relay_url
                .as_deref()
                .context("DOCKHAND_AGENT_RELAY_URL is required in http mode")?;
            let relay: Arc<dyn Transport> = Arc::new(
                HttpTransport::new(relay_url, config.relay_token.clone())
                    .context("failed to set up relay client")?,
            );
            Ok(Connection {
                link: Link::pubsub(relay.clone()),
                beacon: relay,
                log: None,
            })
        }
    }
}

fn fanout_config(config: &AgentConfig) -> Result<FanoutConfig> {
    match &config.metrics_config {
        Some(path) => FanoutConfig::from_file(path)
            .with_context(|| format!("invalid metrics config {}", path.display())),
        None => Ok(FanoutConfig::log_only()),
    }
}

// ===================================================================
// Entry point
// ===================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;
    let server_name = config.resolved_server_name();
    tracing::info!(
        server_name = %server_name,
        mode = ?config.mode,
        valkey_url = %config.valkey_url,
        relay_url = ?config.relay_url,
        "configuration loaded",
    );

    let (signal_tx, signal_rx) = shutdown::channel();
    tokio::spawn(shutdown::listen_for_signals(signal_tx));

    let connection = connect(&config).await?;
    let host = Arc::new(HostMetrics::new());
    let containers = Arc::new(
        DockerContainers::connect()
            .await
            .context("failed to connect to Docker")?,
    );
    let updater = Arc::new(SelfUpdater::for_current_exe()?);
    let router = CommandRouter::new(containers, host.clone(), updater);

    let mut sinks = SinkContext::new(&config.server_key, &server_name, &config.valkey_url);
    if let Some(log) = &connection.log {
        sinks = sinks.with_log(log.clone());
    }
    let publisher = fanout_config(&config)?
        .build(&sinks)
        .await
        .context("failed to set up metric destinations")?;

    // Background loops outlive the dispatcher so they can report its exit.
    let (loops_tx, loops_rx) = shutdown::channel();
    let heartbeat = HeartbeatPublisher::new(
        connection.beacon,
        &config.server_key,
        &server_name,
        config.heartbeat_interval(),
    );
    let heartbeat_task = {
        let stop = loops_rx.clone();
        tokio::spawn(async move { heartbeat.run(stop).await })
    };
    let reporter = MetricsReporter::new(
        host,
        publisher,
        &config.server_key,
        &server_name,
        config.metrics_interval(),
    );
    let reporter_task = tokio::spawn(reporter.run(loops_rx));

    let dispatcher = Dispatcher::new(&config.server_key, connection.link, router)
        .with_grace_period(config.grace_period());
    let stopping = signal_rx.clone();
    let outcome = dispatcher.run(signal_rx).await;
    let stop_requested = *stopping.borrow();

    let _ = loops_tx.send(true);
    if let Err(e) = heartbeat_task.await {
        tracing::warn!(error = %e, "heartbeat task ended abnormally");
    }
    if let Err(e) = reporter_task.await {
        tracing::warn!(error = %e, "metrics task ended abnormally");
    }

    dispatcher_exit(outcome, stop_requested)?;
    tracing::info!("dockhand-agent shut down");
    Ok(())
}

/// A dispatcher that ended without a stop signal lost its command source,
/// so the process exits non-zero and a supervisor restarts it.
fn dispatcher_exit(outcome: Result<(), TransportError>, stop_requested: bool) -> Result<()> {
    outcome.context("dispatcher stopped on a transport error")?;
    anyhow::ensure!(
        stop_requested,
        "command source closed without a stop signal (broker or relay disconnected)"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;

    #[test]
    fn clean_stop_exits_zero() {
        dispatcher_exit(Ok(()), true).unwrap();
    }

    #[test]
    fn lost_command_source_is_a_failure() {
        let err = dispatcher_exit(Ok(()), false).unwrap_err();
        assert!(err.to_string().contains("without a stop signal"));
    }

    #[test]
    fn transport_error_is_a_failure_even_when_stopping() {
        assert!(dispatcher_exit(Err(TransportError::Closed), true).is_err());
    }
}
