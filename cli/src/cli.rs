//! CLI argument parsing with clap derive

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dockhand_common::config::default_valkey_url;
use dockhand_common::{
    ContainerRequest, CreateContainerRequest, MessageType, PortBinding, ProcessesRequest,
    ReplyRoute, TransportMode, UpdateAgentRequest,
};
use serde_json::Value;

use crate::commands;

/// Issue commands to dockhand agents and print their replies
#[derive(Parser)]
#[command(
    name = "dockhandctl",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub conn: ConnectionArgs,

    /// Print single-line JSON
    #[arg(long, global = true)]
    pub compact: bool,

    /// Print failures as a JSON error object on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// How to reach the broker
    #[arg(long, global = true, value_enum, env = "DOCKHAND_MODE", default_value_t = TransportMode::Pubsub)]
    pub mode: TransportMode,

    /// Valkey URL for pubsub and streams modes
    #[arg(long, global = true, env = "DOCKHAND_VALKEY_URL", default_value_t = default_valkey_url())]
    pub valkey_url: String,

    /// Relay base URL for http mode
    #[arg(long, global = true, env = "DOCKHAND_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Bearer token for the relay
    #[arg(long, global = true, env = "DOCKHAND_RELAY_TOKEN", hide_env_values = true)]
    pub relay_token: Option<String>,

    /// Server key of the target agent
    #[arg(long, short = 'k', global = true, env = "DOCKHAND_SERVER_KEY")]
    pub key: Option<String>,

    /// Reply deadline in seconds (default depends on the command)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Reply path convention for pubsub and http modes
    #[arg(long, global = true, value_enum, default_value_t = ReplyRoute::Broadcast)]
    pub reply_route: ReplyRoute,
}

impl ConnectionArgs {
    /// # Errors
    ///
    /// Returns an error when no valid server key was given.
    pub fn server_key(&self) -> Result<&str> {
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("a server key is required (--key or DOCKHAND_SERVER_KEY)"))?;
        dockhand_common::validate_server_key(key)
            .map_err(|reason| anyhow::anyhow!("invalid server key: {reason}"))?;
        Ok(key)
    }

    pub fn timeout_for(&self, kind: &MessageType) -> Duration {
        self.timeout
            .map_or_else(|| kind.default_timeout(), Duration::from_secs)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the agent is alive
    Ping,

    /// Hottest temperature sensor reading
    Temperature,

    /// Memory and swap usage
    Memory,

    /// Usage of every mounted disk
    Disk,

    /// Uptime and boot time
    Uptime,

    /// Top processes by CPU
    Processes {
        /// Number of processes to return
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List containers
    Containers,

    /// Start a container
    Start(ContainerArg),

    /// Stop a container
    Stop(ContainerArg),

    /// Restart a container
    Restart(ContainerArg),

    /// Remove a container
    Remove(ContainerArg),

    /// Pull an image and create a container from it
    Create(CreateArgs),

    /// Replace the agent binary and restart the agent
    Update(UpdateArgs),

    /// Watch an agent's heartbeats
    Heartbeats {
        /// Exit after this many heartbeats
        #[arg(long)]
        count: Option<usize>,
    },
}

#[derive(Args, Debug)]
pub struct ContainerArg {
    /// Container id or name
    pub container_id: String,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Image reference, e.g. `nginx:1.27`
    pub image: String,

    /// Container name
    #[arg(long)]
    pub name: Option<String>,

    /// Environment variable as KEY=value (repeatable)
    #[arg(long = "env", short = 'e', value_parser = parse_env)]
    pub env: Vec<String>,

    /// Port binding as HOST:CONTAINER[/PROTOCOL] (repeatable)
    #[arg(long = "port", short = 'p', value_parser = parse_port)]
    pub ports: Vec<PortBinding>,

    /// Start the container once created
    #[arg(long)]
    pub start: bool,

    /// Command to run instead of the image default
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Download URL of the binary or `.tar.gz` release asset
    pub url: String,

    /// Expected SHA-256 of the download
    #[arg(long)]
    pub sha256: Option<String>,

    /// Version label reported back in the acknowledgement
    #[arg(long = "release")]
    pub release: Option<String>,
}

fn parse_env(raw: &str) -> Result<String, String> {
    match raw.split_once('=') {
        Some((key, _)) if !key.is_empty() => Ok(raw.to_string()),
        _ => Err(format!("expected KEY=value, got '{raw}'")),
    }
}

fn parse_port(raw: &str) -> Result<PortBinding, String> {
    let (ports, protocol) = match raw.split_once('/') {
        Some((ports, protocol @ ("tcp" | "udp" | "sctp"))) => (ports, protocol),
        Some((_, other)) => return Err(format!("unknown protocol '{other}'")),
        None => (raw, "tcp"),
    };
    let (host, container) = ports
        .split_once(':')
        .ok_or_else(|| format!("expected HOST:CONTAINER, got '{raw}'"))?;
    let number = |p: &str| p.parse::<u16>().map_err(|_| format!("invalid port '{p}'"));
    Ok(PortBinding {
        host_port: number(host)?,
        container_port: number(container)?,
        protocol: protocol.to_string(),
    })
}

fn to_value<T: serde::Serialize>(payload: &T) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

impl Command {
    /// The command envelope's type and payload, or `None` for commands that
    /// do not go through an agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn request(&self) -> Result<Option<(MessageType, Value)>> {
        let container = |kind: MessageType, arg: &ContainerArg| -> Result<Option<(MessageType, Value)>> {
            Ok(Some((
                kind,
                to_value(&ContainerRequest {
                    container_id: arg.container_id.clone(),
                })?,
            )))
        };
        let empty = |kind: MessageType| Ok(Some((kind, Value::Object(serde_json::Map::new()))));
        match self {
            Command::Ping => empty(MessageType::Ping),
            Command::Temperature => empty(MessageType::GetTemperature),
            Command::Memory => empty(MessageType::GetMemory),
            Command::Disk => empty(MessageType::GetDisk),
            Command::Uptime => empty(MessageType::GetUptime),
            Command::Containers => empty(MessageType::GetContainers),
            Command::Processes { limit } => Ok(Some((
                MessageType::GetProcesses,
                to_value(&ProcessesRequest { limit: *limit })?,
            ))),
            Command::Start(arg) => container(MessageType::StartContainer, arg),
            Command::Stop(arg) => container(MessageType::StopContainer, arg),
            Command::Restart(arg) => container(MessageType::RestartContainer, arg),
            Command::Remove(arg) => container(MessageType::RemoveContainer, arg),
            Command::Create(args) => Ok(Some((
                MessageType::CreateContainer,
                to_value(&CreateContainerRequest {
                    image: args.image.clone(),
                    name: args.name.clone(),
                    env: args.env.clone(),
                    ports: args.ports.clone(),
                    command: (!args.command.is_empty()).then(|| args.command.clone()),
                    start: args.start,
                })?,
            ))),
            Command::Update(args) => Ok(Some((
                MessageType::UpdateAgent,
                to_value(&UpdateAgentRequest {
                    url: args.url.clone(),
                    sha256: args.sha256.clone(),
                    version: args.release.clone(),
                })?,
            ))),
            Command::Heartbeats { .. } => Ok(None),
        }
    }
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the failure; [`crate::commands::exit_code`] maps it to a
    /// process exit status.
    pub async fn run(self) -> Result<()> {
        match &self.command {
            Command::Heartbeats { count } => {
                commands::heartbeats::run(&self.conn, *count, self.compact).await
            }
            command => match command.request()? {
                Some((kind, payload)) => {
                    commands::call::run(&self.conn, kind, payload, self.compact).await
                }
                None => Ok(()),
            },
        }
    }
}
