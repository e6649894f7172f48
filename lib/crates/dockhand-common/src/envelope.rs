//! Wire envelope exchanged between controller and agents.
//!
//! `decode` only checks the outer structure. The payload stays an untyped
//! JSON value until a consumer asks for the shape implied by the envelope's
//! type via [`Envelope::payload_as`] or [`Envelope::typed_payload`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::channels::ReplyRoute;
use crate::config::timeouts;
use crate::payloads::{ErrorCode, ErrorPayload, Payload};

/// Protocol version stamped on every envelope built by this crate.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },
}

// ── Message types ─────────────────────────────────────────────────────────────

/// Closed vocabulary of envelope types.
///
/// Strings this build does not recognise decode into [`MessageType::Unknown`]
/// so the agent can still reject them by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    GetTemperature,
    GetMemory,
    GetDisk,
    GetUptime,
    GetProcesses,
    GetContainers,
    StartContainer,
    StopContainer,
    RestartContainer,
    RemoveContainer,
    CreateContainer,
    UpdateAgent,
    Ping,
    TemperatureResponse,
    MemoryResponse,
    DiskResponse,
    UptimeResponse,
    ProcessesResponse,
    ContainersResponse,
    StartContainerResponse,
    StopContainerResponse,
    RestartContainerResponse,
    RemoveContainerResponse,
    CreateContainerResponse,
    UpdateAgentResponse,
    Pong,
    Error,
    Unknown(String),
}

impl MessageType {
    /// Every known command type, in wire order.
    pub const COMMANDS: [MessageType; 13] = [
        MessageType::GetTemperature,
        MessageType::GetMemory,
        MessageType::GetDisk,
        MessageType::GetUptime,
        MessageType::GetProcesses,
        MessageType::GetContainers,
        MessageType::StartContainer,
        MessageType::StopContainer,
        MessageType::RestartContainer,
        MessageType::RemoveContainer,
        MessageType::CreateContainer,
        MessageType::UpdateAgent,
        MessageType::Ping,
    ];

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::GetTemperature => "get_temperature",
            MessageType::GetMemory => "get_memory",
            MessageType::GetDisk => "get_disk",
            MessageType::GetUptime => "get_uptime",
            MessageType::GetProcesses => "get_processes",
            MessageType::GetContainers => "get_containers",
            MessageType::StartContainer => "start_container",
            MessageType::StopContainer => "stop_container",
            MessageType::RestartContainer => "restart_container",
            MessageType::RemoveContainer => "remove_container",
            MessageType::CreateContainer => "create_container",
            MessageType::UpdateAgent => "update_agent",
            MessageType::Ping => "ping",
            MessageType::TemperatureResponse => "temperature_response",
            MessageType::MemoryResponse => "memory_response",
            MessageType::DiskResponse => "disk_response",
            MessageType::UptimeResponse => "uptime_response",
            MessageType::ProcessesResponse => "processes_response",
            MessageType::ContainersResponse => "containers_response",
            MessageType::StartContainerResponse => "start_container_response",
            MessageType::StopContainerResponse => "stop_container_response",
            MessageType::RestartContainerResponse => "restart_container_response",
            MessageType::RemoveContainerResponse => "remove_container_response",
            MessageType::CreateContainerResponse => "create_container_response",
            MessageType::UpdateAgentResponse => "update_agent_response",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::Unknown(raw) => raw,
        }
    }

    /// Success reply type for a command, `None` for replies and unknown types.
    #[must_use]
    pub fn reply_type(&self) -> Option<MessageType> {
        let reply = match self {
            MessageType::GetTemperature => MessageType::TemperatureResponse,
            MessageType::GetMemory => MessageType::MemoryResponse,
            MessageType::GetDisk => MessageType::DiskResponse,
            MessageType::GetUptime => MessageType::UptimeResponse,
            MessageType::GetProcesses => MessageType::ProcessesResponse,
            MessageType::GetContainers => MessageType::ContainersResponse,
            MessageType::StartContainer => MessageType::StartContainerResponse,
            MessageType::StopContainer => MessageType::StopContainerResponse,
            MessageType::RestartContainer => MessageType::RestartContainerResponse,
            MessageType::RemoveContainer => MessageType::RemoveContainerResponse,
            MessageType::CreateContainer => MessageType::CreateContainerResponse,
            MessageType::UpdateAgent => MessageType::UpdateAgentResponse,
            MessageType::Ping => MessageType::Pong,
            _ => return None,
        };
        Some(reply)
    }

    #[must_use]
    pub fn is_command(&self) -> bool {
        self.reply_type().is_some()
    }

    /// How long a caller should wait for the reply to this command.
    ///
    /// Container lifecycle operations may pull images or wait for a graceful
    /// shutdown, so they get longer bounds. None of them retry.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        let secs = match self {
            MessageType::CreateContainer => timeouts::CREATE_CONTAINER_SECS,
            MessageType::StartContainer
            | MessageType::StopContainer
            | MessageType::RestartContainer
            | MessageType::RemoveContainer => timeouts::CONTAINER_LIFECYCLE_SECS,
            _ => timeouts::QUERY_SECS,
        };
        Duration::from_secs(secs)
    }
}

impl From<&str> for MessageType {
    fn from(raw: &str) -> Self {
        match raw {
            "get_temperature" => MessageType::GetTemperature,
            "get_memory" => MessageType::GetMemory,
            "get_disk" => MessageType::GetDisk,
            "get_uptime" => MessageType::GetUptime,
            "get_processes" => MessageType::GetProcesses,
            "get_containers" => MessageType::GetContainers,
            "start_container" => MessageType::StartContainer,
            "stop_container" => MessageType::StopContainer,
            "restart_container" => MessageType::RestartContainer,
            "remove_container" => MessageType::RemoveContainer,
            "create_container" => MessageType::CreateContainer,
            "update_agent" => MessageType::UpdateAgent,
            "ping" => MessageType::Ping,
            "temperature_response" => MessageType::TemperatureResponse,
            "memory_response" => MessageType::MemoryResponse,
            "disk_response" => MessageType::DiskResponse,
            "uptime_response" => MessageType::UptimeResponse,
            "processes_response" => MessageType::ProcessesResponse,
            "containers_response" => MessageType::ContainersResponse,
            "start_container_response" => MessageType::StartContainerResponse,
            "stop_container_response" => MessageType::StopContainerResponse,
            "restart_container_response" => MessageType::RestartContainerResponse,
            "remove_container_response" => MessageType::RemoveContainerResponse,
            "create_container_response" => MessageType::CreateContainerResponse,
            "update_agent_response" => MessageType::UpdateAgentResponse,
            "pong" => MessageType::Pong,
            "error" => MessageType::Error,
            other => MessageType::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::from(raw.as_str()))
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id. A reply carries the id of its command.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Reply-path convention of the issuer. Absent on the wire means broadcast.
    #[serde(default, skip_serializing_if = "ReplyRoute::is_broadcast")]
    pub reply_route: ReplyRoute,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Envelope {
    /// New command with a fresh id.
    #[must_use]
    pub fn command(kind: MessageType, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            version: default_version(),
            payload,
            reply_route: ReplyRoute::Broadcast,
        }
    }

    #[must_use]
    pub fn with_reply_route(mut self, route: ReplyRoute) -> Self {
        self.reply_route = route;
        self
    }

    /// Reply to `command`, carrying its id and reply route.
    #[must_use]
    pub fn reply(command: &Envelope, kind: MessageType, payload: serde_json::Value) -> Self {
        Self {
            id: command.id.clone(),
            kind,
            timestamp: Utc::now(),
            version: default_version(),
            payload,
            reply_route: command.reply_route,
        }
    }

    #[must_use]
    pub fn error_reply(command: &Envelope, code: ErrorCode, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            code,
            message: message.into(),
        };
        Self::reply(
            command,
            MessageType::Error,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Every field serializes to string-keyed JSON, which cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse the outer structure of an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the bytes are not an envelope
    /// object or the id is empty. The payload is not validated.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if envelope.id.is_empty() {
            return Err(EnvelopeError::Malformed("empty id".to_string()));
        }
        Ok(envelope)
    }

    /// Deserialize the payload into `T`. A null payload is read as `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidPayload`] when the shape does not match.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let value = if self.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|e| EnvelopeError::InvalidPayload {
            kind: self.kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode the payload into the shape implied by `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidPayload`] on a shape mismatch or when
    /// the type is unknown.
    pub fn typed_payload(&self) -> Result<Payload, EnvelopeError> {
        let payload = match &self.kind {
            MessageType::GetTemperature
            | MessageType::GetMemory
            | MessageType::GetDisk
            | MessageType::GetUptime
            | MessageType::GetContainers
            | MessageType::Ping => Payload::Empty,
            MessageType::GetProcesses => Payload::Processes(self.payload_as()?),
            MessageType::StartContainer
            | MessageType::StopContainer
            | MessageType::RestartContainer
            | MessageType::RemoveContainer => Payload::Container(self.payload_as()?),
            MessageType::CreateContainer => Payload::CreateContainer(self.payload_as()?),
            MessageType::UpdateAgent => Payload::UpdateAgent(self.payload_as()?),
            MessageType::TemperatureResponse => Payload::Temperature(self.payload_as()?),
            MessageType::MemoryResponse => Payload::Memory(self.payload_as()?),
            MessageType::DiskResponse => Payload::Disk(self.payload_as()?),
            MessageType::UptimeResponse => Payload::Uptime(self.payload_as()?),
            MessageType::ProcessesResponse => Payload::ProcessList(self.payload_as()?),
            MessageType::ContainersResponse => Payload::Containers(self.payload_as()?),
            MessageType::StartContainerResponse
            | MessageType::StopContainerResponse
            | MessageType::RestartContainerResponse
            | MessageType::RemoveContainerResponse
            | MessageType::CreateContainerResponse => {
                Payload::ContainerAction(self.payload_as()?)
            }
            MessageType::UpdateAgentResponse => Payload::UpdateStarted(self.payload_as()?),
            MessageType::Pong => Payload::Pong(self.payload_as()?),
            MessageType::Error => Payload::Error(self.payload_as()?),
            MessageType::Unknown(raw) => {
                return Err(EnvelopeError::InvalidPayload {
                    kind: raw.clone(),
                    reason: "unknown message type".to_string(),
                });
            }
        };
        Ok(payload)
    }
}
