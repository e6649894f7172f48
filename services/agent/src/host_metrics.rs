//! Host readings via `sysinfo`.
//!
//! `sysinfo` calls block, so every reading runs on the blocking pool.

use std::ffi::OsStr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockhand_bus::MetricsSource;
use dockhand_common::{DiskUsage, MemoryPayload, ProcessInfo, TemperaturePayload, UptimePayload};
use sysinfo::{Components, Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};

/// Shared `System` so CPU usage is measured against the previous refresh.
#[derive(Clone)]
pub struct HostMetrics {
    system: Arc<Mutex<System>>,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("{what} reader task failed"))?
}

fn lossy<S: AsRef<OsStr> + ?Sized>(value: &S) -> String {
    value.as_ref().to_string_lossy().into_owned()
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
}

/// Hottest reading; sensors reporting NaN are ignored.
fn hottest(readings: impl IntoIterator<Item = (String, f32)>) -> Option<(String, f32)> {
    readings
        .into_iter()
        .filter(|(_, celsius)| celsius.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Highest CPU first, then lowest pid for a stable order.
fn top_by_cpu(mut processes: Vec<ProcessInfo>, limit: usize) -> Vec<ProcessInfo> {
    processes.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then(a.pid.cmp(&b.pid))
    });
    processes.truncate(limit);
    processes
}

#[async_trait]
impl MetricsSource for HostMetrics {
    async fn temperature(&self) -> Result<TemperaturePayload> {
        blocking("temperature", || {
            let components = Components::new_with_refreshed_list();
            let readings = components
                .list()
                .iter()
                .map(|c| (c.label().to_string(), c.temperature()));
            let (sensor, celsius) =
                hottest(readings).context("no temperature sensors available on this host")?;
            Ok(TemperaturePayload {
                temperature: f64::from(celsius),
                unit: "celsius".to_string(),
                sensor,
            })
        })
        .await
    }

    async fn memory(&self) -> Result<MemoryPayload> {
        let system = self.system.clone();
        blocking("memory", move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_memory();
            let total = system.total_memory();
            let available = system.available_memory();
            let used = total.saturating_sub(available);
            Ok(MemoryPayload {
                total_bytes: total,
                used_bytes: used,
                available_bytes: available,
                swap_total_bytes: system.total_swap(),
                swap_used_bytes: system.used_swap(),
                used_percent: percent(used, total),
            })
        })
        .await
    }

    async fn disks(&self) -> Result<Vec<DiskUsage>> {
        blocking("disk", || {
            let disks = Disks::new_with_refreshed_list();
            Ok(disks
                .list()
                .iter()
                .map(|disk| {
                    let total = disk.total_space();
                    let available = disk.available_space();
                    let used = total.saturating_sub(available);
                    DiskUsage {
                        mount_point: disk.mount_point().display().to_string(),
                        filesystem: lossy(disk.file_system()),
                        total_bytes: total,
                        used_bytes: used,
                        available_bytes: available,
                        used_percent: percent(used, total),
                    }
                })
                .collect())
        })
        .await
    }

    async fn uptime(&self) -> Result<UptimePayload> {
        let boot = i64::try_from(System::boot_time()).context("boot time out of range")?;
        Ok(UptimePayload {
            uptime_seconds: System::uptime(),
            boot_time: DateTime::<Utc>::from_timestamp(boot, 0).context("invalid boot time")?,
        })
    }

    async fn processes(&self, limit: usize) -> Result<Vec<ProcessInfo>> {
        let system = self.system.clone();
        blocking("process", move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            // CPU usage is a delta between two refreshes.
            system.refresh_all();
            std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
            system.refresh_all();
            let processes = system
                .processes()
                .iter()
                .map(|(pid, process)| ProcessInfo {
                    pid: pid.as_u32(),
                    name: lossy(process.name()),
                    cpu_percent: process.cpu_usage(),
                    memory_bytes: process.memory(),
                })
                .collect();
            Ok(top_by_cpu(processes, limit))
        })
        .await
    }
}
