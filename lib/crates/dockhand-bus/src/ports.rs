//! Collaborators the agent-side router delegates to.
//!
//! Production adapters live in the agent binary; tests use mocks or fakes.

use anyhow::Result;
use async_trait::async_trait;
use dockhand_common::{
    ContainerActionPayload, ContainerSummary, CreateContainerRequest, DiskUsage, MemoryPayload,
    ProcessInfo, TemperaturePayload, UpdateAgentRequest, UptimePayload,
};

/// Container runtime on the agent's host.
///
/// Action methods return `Ok` with `success = false` when the runtime
/// answered but refused; `Err` is reserved for failures to reach it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn list(&self) -> Result<Vec<ContainerSummary>>;
    async fn start(&self, container_id: &str) -> Result<ContainerActionPayload>;
    async fn stop(&self, container_id: &str) -> Result<ContainerActionPayload>;
    async fn restart(&self, container_id: &str) -> Result<ContainerActionPayload>;
    async fn remove(&self, container_id: &str) -> Result<ContainerActionPayload>;
    async fn create(&self, request: &CreateContainerRequest) -> Result<ContainerActionPayload>;
}

/// Host readings for the `get_*` queries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn temperature(&self) -> Result<TemperaturePayload>;
    async fn memory(&self) -> Result<MemoryPayload>;
    async fn disks(&self) -> Result<Vec<DiskUsage>>;
    async fn uptime(&self) -> Result<UptimePayload>;
    /// Top `limit` processes by CPU usage, highest first.
    async fn processes(&self, limit: usize) -> Result<Vec<ProcessInfo>>;
}

/// Starts a self-update. Must return quickly: the work runs detached and
/// the process restart is the only completion signal.
#[cfg_attr(test, mockall::automock)]
pub trait AgentUpdater: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the update cannot be started at all.
    fn begin(&self, request: UpdateAgentRequest) -> Result<()>;
}
