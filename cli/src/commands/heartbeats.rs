//! Follow an agent's heartbeat channel.

use anyhow::{Context, Result};
use dockhand_bus::CallError;
use dockhand_bus::heartbeat::decode_heartbeat;
use dockhand_common::heartbeat_channel;

use crate::cli::ConnectionArgs;
use crate::{connection, output};

/// Print heartbeats until `count` have arrived or Ctrl-C. With `--timeout`,
/// a gap longer than the timeout ends the watch with a timeout error.
///
/// # Errors
///
/// Returns an error on connection failure, a closed channel, or a gap
/// longer than `--timeout`.
pub async fn run(args: &ConnectionArgs, count: Option<usize>, compact: bool) -> Result<()> {
    let key = args.server_key()?;
    let transport = connection::transport(args).await?;
    let mut subscription = transport.subscribe(&heartbeat_channel(key)).await?;
    let gap = args.timeout.map(std::time::Duration::from_secs);

    let mut seen = 0;
    while count.is_none_or(|limit| seen < limit) {
        let next = async {
            match gap {
                Some(gap) => tokio::time::timeout(gap, subscription.recv())
                    .await
                    .map_err(|_| CallError::Timeout(gap)),
                None => Ok(subscription.recv().await),
            }
        };
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = next => message?,
        };
        let Some(bytes) = message else {
            anyhow::bail!("heartbeat channel for '{key}' closed");
        };
        match decode_heartbeat(&bytes) {
            Ok(beat) => {
                let value = serde_json::to_value(&beat).context("heartbeat is not JSON")?;
                println!("{}", output::render(&value, compact)?);
                seen += 1;
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed heartbeat"),
        }
    }
    let _ = transport.close().await;
    Ok(())
}
