//! Maps each command type to exactly one handler and turns every outcome,
//! including a panic, into exactly one reply envelope.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dockhand_common::{
    ContainerActionPayload, ContainerRequest, ContainersPayload, CreateContainerRequest,
    DiskPayload, Envelope, ErrorCode, MessageType, PongPayload, ProcessesPayload,
    ProcessesRequest, UpdateAgentRequest, UpdateStartedPayload,
};
use futures::FutureExt as _;
use serde::Serialize;
use thiserror::Error;

use crate::ports::{AgentUpdater, ContainerManager, MetricsSource};

/// Processes returned when the request names no limit.
pub const DEFAULT_PROCESS_LIMIT: usize = 20;
/// Upper bound on a requested process limit.
pub const MAX_PROCESS_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown command type: {0}")]
    InvalidCommand(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::InvalidCommand(_) => ErrorCode::InvalidCommand,
            HandlerError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            HandlerError::Failed(_) => ErrorCode::OperationFailed,
        }
    }
}

fn failed(e: &anyhow::Error) -> HandlerError {
    HandlerError::Failed(format!("{e:#}"))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| HandlerError::Failed(e.to_string()))
}

fn request<T: serde::de::DeserializeOwned>(command: &Envelope) -> Result<T, HandlerError> {
    command
        .payload_as()
        .map_err(|e| HandlerError::InvalidPayload(e.to_string()))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// A refused container action is a failure even though the runtime answered.
fn action_reply(
    verb: &str,
    result: anyhow::Result<ContainerActionPayload>,
) -> Result<serde_json::Value, HandlerError> {
    let payload = result.map_err(|e| failed(&e))?;
    if !payload.success {
        let detail = payload.message.as_deref().unwrap_or("no detail");
        return Err(HandlerError::Failed(format!(
            "{verb} {} failed: {detail}",
            payload.container_id
        )));
    }
    to_json(&payload)
}

#[derive(Clone)]
pub struct CommandRouter {
    containers: Arc<dyn ContainerManager>,
    metrics: Arc<dyn MetricsSource>,
    updater: Arc<dyn AgentUpdater>,
}

impl CommandRouter {
    pub fn new(
        containers: Arc<dyn ContainerManager>,
        metrics: Arc<dyn MetricsSource>,
        updater: Arc<dyn AgentUpdater>,
    ) -> Self {
        Self {
            containers,
            metrics,
            updater,
        }
    }

    /// Run the handler for `command` and build its reply.
    ///
    /// Never fails: returned errors and panics become `error` replies.
    pub async fn dispatch(&self, command: &Envelope) -> Envelope {
        match AssertUnwindSafe(self.handle(command)).catch_unwind().await {
            Ok(Ok((kind, payload))) => Envelope::reply(command, kind, payload),
            Ok(Err(e)) => {
                tracing::warn!(command_id = %command.id, kind = %command.kind, error = %e, "command failed");
                Envelope::error_reply(command, e.code(), e.to_string())
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(command_id = %command.id, kind = %command.kind, panic = detail, "handler panicked");
                Envelope::error_reply(
                    command,
                    ErrorCode::InternalError,
                    format!("handler for '{}' panicked: {detail}", command.kind),
                )
            }
        }
    }

    async fn handle(
        &self,
        command: &Envelope,
    ) -> Result<(MessageType, serde_json::Value), HandlerError> {
        let Some(reply_kind) = command.kind.reply_type() else {
            return Err(HandlerError::InvalidCommand(command.kind.to_string()));
        };
        let payload = match &command.kind {
            MessageType::Ping => to_json(&PongPayload::healthy())?,
            MessageType::GetTemperature => {
                to_json(&self.metrics.temperature().await.map_err(|e| failed(&e))?)?
            }
            MessageType::GetMemory => to_json(&self.metrics.memory().await.map_err(|e| failed(&e))?)?,
            MessageType::GetDisk => {
                let disks = self.metrics.disks().await.map_err(|e| failed(&e))?;
                to_json(&DiskPayload { disks })?
            }
            MessageType::GetUptime => to_json(&self.metrics.uptime().await.map_err(|e| failed(&e))?)?,
            MessageType::GetProcesses => {
                let ProcessesRequest { limit } = request(command)?;
                let limit = limit
                    .unwrap_or(DEFAULT_PROCESS_LIMIT)
                    .clamp(1, MAX_PROCESS_LIMIT);
                let processes = self.metrics.processes(limit).await.map_err(|e| failed(&e))?;
                to_json(&ProcessesPayload { processes })?
            }
            MessageType::GetContainers => {
                let containers = self.containers.list().await.map_err(|e| failed(&e))?;
                to_json(&ContainersPayload { containers })?
            }
            MessageType::StartContainer
            | MessageType::StopContainer
            | MessageType::RestartContainer
            | MessageType::RemoveContainer => self.container_action(command).await?,
            MessageType::CreateContainer => {
                let create: CreateContainerRequest = request(command)?;
                if create.image.trim().is_empty() {
                    return Err(HandlerError::InvalidPayload("image must not be empty".to_string()));
                }
                action_reply("create", self.containers.create(&create).await)?
            }
            MessageType::UpdateAgent => {
                let update: UpdateAgentRequest = request(command)?;
                if update.url.trim().is_empty() {
                    return Err(HandlerError::InvalidPayload("url must not be empty".to_string()));
                }
                let version = update.version.clone();
                self.updater.begin(update).map_err(|e| failed(&e))?;
                to_json(&UpdateStartedPayload {
                    status: "started".to_string(),
                    version,
                })?
            }
            other => return Err(HandlerError::InvalidCommand(other.to_string())),
        };
        Ok((reply_kind, payload))
    }

    async fn container_action(&self, command: &Envelope) -> Result<serde_json::Value, HandlerError> {
        let ContainerRequest { container_id } = request(command)?;
        if container_id.trim().is_empty() {
            return Err(HandlerError::InvalidPayload(
                "container_id must not be empty".to_string(),
            ));
        }
        let id = container_id.as_str();
        match command.kind {
            MessageType::StartContainer => action_reply("start", self.containers.start(id).await),
            MessageType::StopContainer => action_reply("stop", self.containers.stop(id).await),
            MessageType::RestartContainer => {
                action_reply("restart", self.containers.restart(id).await)
            }
            _ => action_reply("remove", self.containers.remove(id).await),
        }
    }
}
