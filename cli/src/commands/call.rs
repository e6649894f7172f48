//! One command, one reply.

use anyhow::Result;
use dockhand_bus::Correlator;
use dockhand_common::MessageType;
use serde_json::Value;

use crate::cli::ConnectionArgs;
use crate::{connection, output};

/// Send `kind` to the target agent and print the reply payload.
///
/// # Errors
///
/// Returns the connection failure or the [`dockhand_bus::CallError`].
pub async fn run(args: &ConnectionArgs, kind: MessageType, payload: Value, compact: bool) -> Result<()> {
    let key = args.server_key()?;
    let timeout = args.timeout_for(&kind);
    let correlator = Correlator::new(connection::link(args).await?);
    let reply = correlator.call(key, kind, payload, timeout).await?;
    tracing::debug!(command_id = %reply.id, kind = %reply.kind, "reply received");
    println!("{}", output::render(&reply.payload, compact)?);
    Ok(())
}
