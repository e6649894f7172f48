//! Opening a broker connection from the global CLI flags.

use std::sync::Arc;

use anyhow::{Context, Result};
use dockhand_bus::transport::{HttpTransport, ValkeyTransport};
use dockhand_bus::{Link, Transport};
use dockhand_common::TransportMode;

use crate::cli::ConnectionArgs;

/// Pub/sub transport for the selected mode. Streams mode still uses Valkey
/// pub/sub here; callers that want the ordered log go through [`link`].
///
/// # Errors
///
/// Returns an error if the broker or relay cannot be reached.
pub async fn transport(args: &ConnectionArgs) -> Result<Arc<dyn Transport>> {
    match args.mode {
        TransportMode::Pubsub | TransportMode::Streams => Ok(Arc::new(valkey(args).await?)),
        TransportMode::Http => {
            let relay_url = args
                .relay_url
                .as_deref()
                .context("http mode needs --relay-url or DOCKHAND_RELAY_URL")?;
            let relay = HttpTransport::new(relay_url, args.relay_token.clone())
                .context("invalid relay configuration")?;
            Ok(Arc::new(relay))
        }
    }
}

/// Calling convention for commands.
///
/// # Errors
///
/// Returns an error if the broker or relay cannot be reached.
pub async fn link(args: &ConnectionArgs) -> Result<Link> {
    match args.mode {
        TransportMode::Streams => Ok(Link::Streams(Arc::new(valkey(args).await?.streams()))),
        TransportMode::Pubsub | TransportMode::Http => {
            Ok(Link::pubsub(transport(args).await?).with_route(args.reply_route))
        }
    }
}

async fn valkey(args: &ConnectionArgs) -> Result<ValkeyTransport> {
    ValkeyTransport::connect(&args.valkey_url)
        .await
        .with_context(|| format!("failed to connect to Valkey at {}", args.valkey_url))
}
