//! Mapping between envelopes and ordered-log entry fields.
//!
//! Command entries carry the envelope as flat fields. Reply entries get their
//! own entry id and point back at the command through `command_id`.

use chrono::{DateTime, Utc};
use dockhand_common::{Envelope, EnvelopeError, MessageType, ReplyRoute, PROTOCOL_VERSION};

use crate::transport::LogEntry;

pub const FIELD_ID: &str = "id";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_COMMAND_ID: &str = "command_id";
pub const FIELD_REPLY_ROUTE: &str = "reply_route";

fn payload_text(envelope: &Envelope) -> String {
    envelope.payload.to_string()
}

/// Fields for appending `command` to a command stream.
#[must_use]
pub fn command_fields(command: &Envelope) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (FIELD_ID, command.id.clone()),
        (FIELD_TYPE, command.kind.to_string()),
        (FIELD_PAYLOAD, payload_text(command)),
        (FIELD_TIMESTAMP, command.timestamp.to_rfc3339()),
        (FIELD_VERSION, command.version.clone()),
    ];
    if command.reply_route == ReplyRoute::PerCommand {
        fields.push((FIELD_REPLY_ROUTE, "per_command".to_string()));
    }
    fields
}

/// Fields for appending `reply` to a reply stream.
#[must_use]
pub fn reply_fields(reply: &Envelope) -> Vec<(&'static str, String)> {
    vec![
        (FIELD_TYPE, reply.kind.to_string()),
        (FIELD_ID, uuid::Uuid::new_v4().to_string()),
        (FIELD_COMMAND_ID, reply.id.clone()),
        (FIELD_PAYLOAD, payload_text(reply)),
        (FIELD_TIMESTAMP, reply.timestamp.to_rfc3339()),
    ]
}

fn required<'a>(entry: &'a LogEntry, name: &str) -> Result<&'a str, EnvelopeError> {
    entry
        .field(name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EnvelopeError::Malformed(format!("entry {} has no '{name}' field", entry.id)))
}

fn parse_payload(entry: &LogEntry) -> Result<serde_json::Value, EnvelopeError> {
    match entry.field(FIELD_PAYLOAD) {
        None | Some("") => Ok(serde_json::Value::Null),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| EnvelopeError::Malformed(format!("entry {} payload: {e}", entry.id))),
    }
}

fn parse_timestamp(entry: &LogEntry) -> DateTime<Utc> {
    entry
        .field(FIELD_TIMESTAMP)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |ts| ts.with_timezone(&Utc))
}

fn envelope_from(entry: &LogEntry, id: &str) -> Result<Envelope, EnvelopeError> {
    let reply_route = match entry.field(FIELD_REPLY_ROUTE) {
        Some("per_command") => ReplyRoute::PerCommand,
        _ => ReplyRoute::Broadcast,
    };
    Ok(Envelope {
        id: id.to_string(),
        kind: MessageType::from(required(entry, FIELD_TYPE)?),
        timestamp: parse_timestamp(entry),
        version: entry
            .field(FIELD_VERSION)
            .unwrap_or(PROTOCOL_VERSION)
            .to_string(),
        payload: parse_payload(entry)?,
        reply_route,
    })
}

/// Rebuild a command envelope from a command-stream entry.
///
/// # Errors
///
/// Returns [`EnvelopeError::Malformed`] when `id` or `type` is missing or the
/// payload is not JSON.
pub fn command_from_entry(entry: &LogEntry) -> Result<Envelope, EnvelopeError> {
    let id = required(entry, FIELD_ID)?;
    envelope_from(entry, id)
}

/// Rebuild a reply envelope whose id is the originating command's id.
///
/// # Errors
///
/// Returns [`EnvelopeError::Malformed`] when `command_id` or `type` is
/// missing or the payload is not JSON.
pub fn reply_from_entry(entry: &LogEntry) -> Result<Envelope, EnvelopeError> {
    let command_id = required(entry, FIELD_COMMAND_ID)?;
    envelope_from(entry, command_id)
}
