//! dockhand relay entry point.
//!
//! Initialises tracing, loads configuration from `DOCKHAND_RELAY_*`
//! environment variables, connects to Valkey and serves the HTTP tunnel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dockhand_bus::shutdown;
use dockhand_bus::transport::ValkeyTransport;
use dockhand_relay::{router, run_reaper, RelaySettings, RelayState};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

// ===================================================================
// Configuration
// ===================================================================

/// Each field maps to `DOCKHAND_RELAY_<FIELD>`:
///   - `DOCKHAND_RELAY_LISTEN_ADDR`       (default `0.0.0.0:8090`)
///   - `DOCKHAND_RELAY_VALKEY_URL`        (default `redis://valkey:6379`)
///   - `DOCKHAND_RELAY_TOKEN`             (optional shared bearer token)
///   - `DOCKHAND_RELAY_IDLE_TIMEOUT_SECS` (default 120)
///   - `DOCKHAND_RELAY_MAX_WAIT_MS`       (default 30000)
#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_listen_addr")]
    listen_addr: String,

    #[serde(default = "dockhand_common::config::default_valkey_url")]
    valkey_url: String,

    token: Option<String>,

    #[serde(default = "default_idle_timeout_secs")]
    idle_timeout_secs: u64,

    #[serde(default = "default_max_wait_ms")]
    max_wait_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_max_wait_ms() -> u64 {
    30_000
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

    let config: Config = envy::prefixed("DOCKHAND_RELAY_")
        .from_env()
        .context("failed to load config from DOCKHAND_RELAY_* env vars")?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        valkey_url = %config.valkey_url,
        auth_enabled = config.token.is_some(),
        "configuration loaded",
    );

    let upstream = ValkeyTransport::connect(&config.valkey_url)
        .await
        .context("failed to connect to Valkey")?;

    let state = RelayState::new(
        Arc::new(upstream),
        RelaySettings {
            token: config.token,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_wait: Duration::from_millis(config.max_wait_ms),
        },
    );

    let (stop_tx, stop_rx) = shutdown::channel();
    tokio::spawn(shutdown::listen_for_signals(stop_tx));
    let reaper = tokio::spawn(run_reaper(state.clone(), stop_rx.clone()));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("failed to bind TCP listener")?;
    tracing::info!("relay ready on http://{}", config.listen_addr);

    let mut server_stop = stop_rx;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown::wait_for(&mut server_stop).await })
        .await
        .context("HTTP server error")?;

    reaper.await.context("reaper task panicked")?;
    tracing::info!("dockhand-relay shut down");
    Ok(())
}
