//! Host-side adapters and background loops of the dockhand agent.

pub mod config;
pub mod docker;
pub mod host_metrics;
pub mod reporter;
pub mod updater;

pub use config::AgentConfig;
pub use docker::DockerContainers;
pub use host_metrics::HostMetrics;
pub use reporter::MetricsReporter;
pub use updater::SelfUpdater;
