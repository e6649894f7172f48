//! Shared fakes and harness for the bus integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dockhand_bus::{
    shutdown, AgentUpdater, CommandRouter, ContainerManager, Dispatcher, DispatcherState, Link,
    MetricsSource, TransportError,
};
use dockhand_common::{
    ContainerActionPayload, ContainerSummary, CreateContainerRequest, DiskUsage, MemoryPayload,
    ProcessInfo, TemperaturePayload, UpdateAgentRequest, UptimePayload,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Host with one container and fixed readings. Temperature panics when
/// `faulty_sensor` is set.
#[derive(Default)]
pub struct FakeHost {
    pub faulty_sensor: bool,
    pub memory_reads: AtomicUsize,
}

impl FakeHost {
    pub fn faulty() -> Self {
        Self {
            faulty_sensor: true,
            ..Self::default()
        }
    }
}

fn action(container_id: &str, state: &str) -> ContainerActionPayload {
    ContainerActionPayload {
        container_id: container_id.to_string(),
        success: container_id == "web",
        state: state.to_string(),
        message: (container_id != "web").then(|| "no such container".to_string()),
    }
}

#[async_trait]
impl ContainerManager for FakeHost {
    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        Ok(vec![ContainerSummary {
            id: "web".to_string(),
            name: "web".to_string(),
            image: "nginx:1.27".to_string(),
            state: "running".to_string(),
            status: "Up 2 hours".to_string(),
        }])
    }

    async fn start(&self, container_id: &str) -> Result<ContainerActionPayload> {
        Ok(action(container_id, "running"))
    }

    async fn stop(&self, container_id: &str) -> Result<ContainerActionPayload> {
        Ok(action(container_id, "exited"))
    }

    async fn restart(&self, container_id: &str) -> Result<ContainerActionPayload> {
        Ok(action(container_id, "running"))
    }

    async fn remove(&self, container_id: &str) -> Result<ContainerActionPayload> {
        Ok(action(container_id, "removed"))
    }

    async fn create(&self, request: &CreateContainerRequest) -> Result<ContainerActionPayload> {
        Ok(ContainerActionPayload {
            container_id: request.name.clone().unwrap_or_else(|| "c0ffee".to_string()),
            success: true,
            state: if request.start { "running" } else { "created" }.to_string(),
            message: None,
        })
    }
}

#[async_trait]
impl MetricsSource for FakeHost {
    async fn temperature(&self) -> Result<TemperaturePayload> {
        assert!(!self.faulty_sensor, "sensor bus fault");
        Ok(TemperaturePayload {
            temperature: 48.5,
            unit: "celsius".to_string(),
            sensor: "coretemp".to_string(),
        })
    }

    async fn memory(&self) -> Result<MemoryPayload> {
        self.memory_reads.fetch_add(1, Ordering::SeqCst);
        // Slow enough that concurrent calls overlap.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(MemoryPayload {
            total_bytes: 8 << 30,
            used_bytes: 2 << 30,
            available_bytes: 6 << 30,
            swap_total_bytes: 0,
            swap_used_bytes: 0,
            used_percent: 25.0,
        })
    }

    async fn disks(&self) -> Result<Vec<DiskUsage>> {
        Ok(vec![DiskUsage {
            mount_point: "/".to_string(),
            filesystem: "ext4".to_string(),
            total_bytes: 100,
            used_bytes: 40,
            available_bytes: 60,
            used_percent: 40.0,
        }])
    }

    async fn uptime(&self) -> Result<UptimePayload> {
        Ok(UptimePayload {
            uptime_seconds: 3600,
            boot_time: Utc::now() - chrono::Duration::hours(1),
        })
    }

    async fn processes(&self, limit: usize) -> Result<Vec<ProcessInfo>> {
        Ok((0..limit.min(3))
            .map(|i| ProcessInfo {
                pid: 100 + u32::try_from(i).unwrap_or(0),
                name: format!("proc{i}"),
                cpu_percent: 10.0,
                memory_bytes: 1024,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingUpdater {
    pub started: AtomicUsize,
}

impl AgentUpdater for RecordingUpdater {
    fn begin(&self, _request: UpdateAgentRequest) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn router(host: Arc<FakeHost>) -> CommandRouter {
    router_with_updater(host, Arc::new(RecordingUpdater::default()))
}

pub fn router_with_updater(host: Arc<FakeHost>, updater: Arc<RecordingUpdater>) -> CommandRouter {
    CommandRouter::new(host.clone(), host, updater)
}

/// Running dispatcher plus the handle needed to stop it.
pub struct Agent {
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<Result<(), TransportError>>,
}

impl Agent {
    /// Start a dispatcher and wait until it is subscribed.
    pub async fn start(key: &str, link: Link, router: CommandRouter) -> Self {
        let dispatcher = Arc::new(
            Dispatcher::new(key, link, router).with_stream_wait(Duration::from_millis(50)),
        );
        let mut state = dispatcher.state();
        let (stop, stop_rx) = shutdown::channel();
        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(stop_rx).await })
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == DispatcherState::Subscribed),
        )
        .await
        .expect("dispatcher never subscribed")
        .expect("dispatcher state dropped");
        Self { stop, task }
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .expect("dispatcher did not stop")
            .expect("dispatcher panicked")
            .expect("dispatcher failed");
    }
}
