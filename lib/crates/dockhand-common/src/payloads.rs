use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error category carried by every `error` reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The command type is unknown or is not a command.
    InvalidCommand,
    /// The command payload does not match the shape for its type.
    InvalidPayload,
    /// The handler ran and reported failure.
    OperationFailed,
    /// The handler faulted before producing a result.
    InternalError,
    /// A code this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Payload of the generic `error` reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Payload of `pong`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PongPayload {
    pub status: String,
}

impl PongPayload {
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemperaturePayload {
    pub temperature: f64,
    /// Always `"celsius"` for readings produced by this crate.
    pub unit: String,
    pub sensor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryPayload {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskUsage {
    pub mount_point: String,
    pub filesystem: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskPayload {
    pub disks: Vec<DiskUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UptimePayload {
    pub uptime_seconds: u64,
    pub boot_time: DateTime<Utc>,
}

/// Optional parameters of `get_processes`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProcessesRequest {
    /// Number of processes to return, highest CPU first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessesPayload {
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Engine state, e.g. `running` or `exited`.
    pub state: String,
    /// Human-readable status, e.g. `Up 3 hours`.
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainersPayload {
    pub containers: Vec<ContainerSummary>,
}

/// Payload of start/stop/restart/remove commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Payload of `create_container`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateContainerRequest {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `KEY=value` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Start the container after creating it.
    #[serde(default)]
    pub start: bool,
}

/// Result of a container lifecycle command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerActionPayload {
    pub container_id: String,
    pub success: bool,
    /// State reported by the engine after the action.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of `update_agent`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateAgentRequest {
    /// Download URL of the new binary or `.tar.gz` release asset.
    pub url: String,
    /// Expected SHA-256 of the download (lowercase hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Acknowledgement of `update_agent`. There is no later completion reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateStartedPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Online,
    Offline,
}

/// Message published on `heartbeat:{server_key}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub server_key: String,
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: HeartbeatStatus,
}

/// Single metric value handed to the fan-out publisher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub server_key: String,
    pub server_name: String,
    /// Dotted metric name, e.g. `memory.used_percent`.
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Payload decoded into the shape implied by an envelope's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Commands that carry no parameters.
    Empty,
    Processes(ProcessesRequest),
    Container(ContainerRequest),
    CreateContainer(CreateContainerRequest),
    UpdateAgent(UpdateAgentRequest),
    Temperature(TemperaturePayload),
    Memory(MemoryPayload),
    Disk(DiskPayload),
    Uptime(UptimePayload),
    ProcessList(ProcessesPayload),
    Containers(ContainersPayload),
    ContainerAction(ContainerActionPayload),
    UpdateStarted(UpdateStartedPayload),
    Pong(PongPayload),
    Error(ErrorPayload),
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serde_screaming_snake() {
        let cases = [
            (ErrorCode::InvalidCommand, "\"INVALID_COMMAND\""),
            (ErrorCode::InvalidPayload, "\"INVALID_PAYLOAD\""),
            (ErrorCode::OperationFailed, "\"OPERATION_FAILED\""),
            (ErrorCode::InternalError, "\"INTERNAL_ERROR\""),
        ];
        for (variant, expected_json) in &cases {
            let json = serde_json::to_string(variant).unwrap();
            assert_eq!(&json, expected_json);
            let deserialized: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(&deserialized, variant);
        }
    }

    #[test]
    fn error_code_unrecognised_decodes_as_unknown() {
        let code: ErrorCode = serde_json::from_str("\"QUOTA_EXCEEDED\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
    }

    #[test]
    fn pong_healthy_status() {
        assert_eq!(
            serde_json::to_value(PongPayload::healthy()).unwrap(),
            serde_json::json!({"status": "healthy"})
        );
    }

    #[test]
    fn create_container_request_minimal_json() {
        let req: CreateContainerRequest =
            serde_json::from_str(r#"{"image":"nginx:1.27"}"#).unwrap();
        assert_eq!(req.image, "nginx:1.27");
        assert!(req.name.is_none());
        assert!(req.env.is_empty());
        assert!(!req.start);
    }

    #[test]
    fn port_binding_protocol_defaults_to_tcp() {
        let port: PortBinding =
            serde_json::from_str(r#"{"host_port":8080,"container_port":80}"#).unwrap();
        assert_eq!(port.protocol, "tcp");
    }

    #[test]
    fn heartbeat_wire_shape() {
        let hb = HeartbeatPayload {
            server_key: "k".to_string(),
            server_name: "web-1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            status: HeartbeatStatus::Online,
        };
        let value = serde_json::to_value(&hb).unwrap();
        assert_eq!(value["server_key"], "k");
        assert_eq!(value["server_name"], "web-1");
        assert_eq!(value["timestamp"], "2026-01-01T00:00:00Z");
        assert_eq!(value["status"], "online");
    }

    #[test]
    fn metric_sample_omits_empty_labels() {
        let sample = MetricSample {
            server_key: "k".to_string(),
            server_name: "web-1".to_string(),
            name: "memory.used_percent".to_string(),
            value: 41.5,
            unit: "percent".to_string(),
            timestamp: Utc::now(),
            labels: BTreeMap::new(),
        };
        let value = serde_json::to_value(&sample).unwrap();
        assert!(value.get("labels").is_none());
    }
}
