//! Container runtime adapter over the local Docker engine.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary as EngineSummary, HostConfig, PortBinding as EnginePort};
use bollard::Docker;
use dockhand_bus::ContainerManager;
use dockhand_common::{ContainerActionPayload, ContainerSummary, CreateContainerRequest, PortBinding};
use futures::TryStreamExt as _;

pub struct DockerContainers {
    docker: Docker,
}

impl DockerContainers {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine does not answer a ping.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("failed to configure Docker client")?;
        docker.ping().await.context("Docker engine did not answer ping")?;
        Ok(Self { docker })
    }

    async fn state_of(&self, container_id: &str) -> String {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => info
                .state
                .and_then(|state| state.status)
                .map_or_else(|| "unknown".to_string(), |status| status.to_string()),
            Err(e) => {
                tracing::debug!(container_id, error = %e, "inspect after action failed");
                "unknown".to_string()
            }
        }
    }

    /// Fold an engine call into an action payload.
    async fn finish(
        &self,
        verb: &str,
        container_id: &str,
        result: Result<(), DockerError>,
    ) -> Result<ContainerActionPayload> {
        match result {
            Ok(()) => Ok(ContainerActionPayload {
                container_id: container_id.to_string(),
                success: true,
                state: self.state_of(container_id).await,
                message: None,
            }),
            Err(e) => match refusal(&e) {
                Some(outcome) => {
                    tracing::info!(container_id, verb, error = %e, "engine refused action");
                    Ok(outcome.into_payload(container_id, e.to_string()))
                }
                None => Err(anyhow::Error::new(e).context(format!("{verb} {container_id}"))),
            },
        }
    }
}

/// How the engine answered an action it did not perform.
#[derive(Debug, PartialEq, Eq)]
enum Refusal {
    /// 304: already in the requested state.
    AlreadyDone,
    /// 404 or 409: missing container or conflicting state.
    Rejected,
}

impl Refusal {
    fn into_payload(self, container_id: &str, message: String) -> ContainerActionPayload {
        let (success, state) = match self {
            Refusal::AlreadyDone => (true, "unchanged"),
            Refusal::Rejected => (false, "unknown"),
        };
        ContainerActionPayload {
            container_id: container_id.to_string(),
            success,
            state: state.to_string(),
            message: Some(message),
        }
    }
}

fn refusal(error: &DockerError) -> Option<Refusal> {
    match error {
        DockerError::DockerResponseServerError { status_code: 304, .. } => Some(Refusal::AlreadyDone),
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        } => Some(Refusal::Rejected),
        _ => None,
    }
}

fn summarize(engine: EngineSummary) -> ContainerSummary {
    let id = engine.id.unwrap_or_default();
    let name = engine
        .names
        .and_then(|names| names.into_iter().next())
        .map_or_else(|| id.chars().take(12).collect(), |n| n.trim_start_matches('/').to_string());
    ContainerSummary {
        name,
        image: engine.image.unwrap_or_default(),
        state: engine.state.unwrap_or_default(),
        status: engine.status.unwrap_or_default(),
        id,
    }
}

/// Engine port maps keyed by `"{container_port}/{protocol}"`.
fn port_maps(
    ports: &[PortBinding],
) -> (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<EnginePort>>>,
) {
    let mut exposed = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<EnginePort>>> = HashMap::new();
    for port in ports {
        let key = format!("{}/{}", port.container_port, port.protocol);
        exposed.insert(key.clone(), HashMap::new());
        bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(EnginePort {
                host_ip: None,
                host_port: Some(port.host_port.to_string()),
            });
    }
    (exposed, bindings)
}

fn create_config(request: &CreateContainerRequest) -> Config<String> {
    let (exposed, bindings) = port_maps(&request.ports);
    Config {
        image: Some(request.image.clone()),
        env: (!request.env.is_empty()).then(|| request.env.clone()),
        cmd: request.command.clone(),
        exposed_ports: (!exposed.is_empty()).then_some(exposed),
        host_config: Some(HostConfig {
            port_bindings: (!bindings.is_empty()).then_some(bindings),
            ..HostConfig::default()
        }),
        ..Config::default()
    }
}

#[async_trait]
impl ContainerManager for DockerContainers {
    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..ListContainersOptions::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("failed to list containers")?;
        Ok(containers.into_iter().map(summarize).collect())
    }

    async fn start(&self, container_id: &str) -> Result<ContainerActionPayload> {
        let result = self
            .docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await;
        self.finish("start", container_id, result).await
    }

    async fn stop(&self, container_id: &str) -> Result<ContainerActionPayload> {
        let result = self
            .docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await;
        self.finish("stop", container_id, result).await
    }

    async fn restart(&self, container_id: &str) -> Result<ContainerActionPayload> {
        let result = self
            .docker
            .restart_container(container_id, None::<RestartContainerOptions>)
            .await;
        self.finish("restart", container_id, result).await
    }

    async fn remove(&self, container_id: &str) -> Result<ContainerActionPayload> {
        let options = RemoveContainerOptions {
            force: true,
            ..RemoveContainerOptions::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(ContainerActionPayload {
                container_id: container_id.to_string(),
                success: true,
                state: "removed".to_string(),
                message: None,
            }),
            Err(e) => self.finish("remove", container_id, Err(e)).await,
        }
    }

    async fn create(&self, request: &CreateContainerRequest) -> Result<ContainerActionPayload> {
        tracing::info!(image = %request.image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: request.image.clone(),
                    ..CreateImageOptions::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("failed to pull {}", request.image))?;

        let options = request.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });
        let created = self
            .docker
            .create_container(options, create_config(request))
            .await
            .with_context(|| format!("failed to create container from {}", request.image))?;
        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, %warning, "engine warning on create");
        }

        if request.start {
            return self.start(&created.id).await;
        }
        Ok(ContainerActionPayload {
            state: self.state_of(&created.id).await,
            container_id: created.id,
            success: true,
            message: None,
        })
    }
}
