//! OS-specific device backends and the context they run setup in.

pub mod android;
pub mod ios;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use farm_proto::DeviceOs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::actions::{ActionError, ActionOutput, DeviceAction};
use crate::appium::{grid_node_args, grid_node_toml, AppiumTarget};
use crate::device::{DevicePorts, DeviceRuntime, DeviceSlot};
use crate::logging::{write_line, DeviceLogs, InitError};
use crate::ports::{PortAllocator, PortError};
use crate::probes::{await_ready, spawn_readiness_probe, ProbePolicy, AUTOMATION_DEADLINE};
use crate::tools::{spawn_service, ServiceSpec, ToolError};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Logs(#[from] InitError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{what} not ready within {deadline:?}")]
    NotReady { what: &'static str, deadline: Duration },
    #[error("developer mode is disabled on the device")]
    DeveloperModeDisabled,
    #[error("unexpected output: {0}")]
    Parse(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("setup cancelled")]
    Cancelled,
    #[error("grid node config: {0}")]
    GridConfig(#[from] toml::ser::Error),
}

/// Grid registration target shared by both backends.
#[derive(Debug, Clone)]
pub struct GridNode {
    pub url: String,
    pub jar: PathBuf,
    pub java: String,
}

/// An unexpected failure of a scoped agent, tagged with the setup generation
/// that started it.
#[derive(Debug, Clone)]
pub struct Fault {
    pub udid: String,
    pub generation: u64,
    pub reason: String,
}

#[async_trait]
pub trait PlatformBackend: Send + Sync {
    fn os(&self) -> DeviceOs;

    /// UDIDs currently attached to this host.
    async fn enumerate(&self) -> Result<HashSet<String>, SetupError>;

    /// Runs the OS-specific setup through to a ready automation server.
    async fn prepare(&self, ctx: &DeviceContext) -> Result<(), SetupError>;

    /// Best-effort cleanup of host-side state the scope does not own.
    async fn teardown(&self, _slot: &DeviceSlot, _ports: DevicePorts) {}

    async fn perform(&self, slot: &DeviceSlot, action: DeviceAction) -> Result<ActionOutput, ActionError>;
}

/// Everything a setup run may touch. Ports and services registered here are
/// released or stopped when the device resets.
pub struct DeviceContext {
    pub slot: Arc<DeviceSlot>,
    pub generation: u64,
    pub scope: CancellationToken,
    pub logs: Arc<DeviceLogs>,
    pub log_dir: PathBuf,
    pub http: reqwest::Client,
    ports: Arc<PortAllocator>,
    faults: mpsc::UnboundedSender<Fault>,
}

impl DeviceContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slot: Arc<DeviceSlot>,
        generation: u64,
        scope: CancellationToken,
        logs: Arc<DeviceLogs>,
        log_dir: PathBuf,
        http: reqwest::Client,
        ports: Arc<PortAllocator>,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Self {
        Self {
            slot,
            generation,
            scope,
            logs,
            log_dir,
            http,
            ports,
            faults,
        }
    }

    pub fn udid(&self) -> &str {
        self.slot.udid()
    }

    pub fn log(&self, line: &str) {
        write_line(&self.logs.device, "supervisor", line);
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceRuntime) -> R) -> R {
        self.slot.update(f)
    }

    /// Reserves a port and records it on the device so a reset releases it.
    pub async fn allocate_port(&self, assign: impl FnOnce(&mut DevicePorts, u16)) -> Result<u16, SetupError> {
        let port = self.ports.get_free().await?;
        self.slot.update(|rt| assign(&mut rt.ports, port));
        debug!(udid = %self.udid(), port, "port assigned");
        Ok(port)
    }

    /// Starts a child inside the device scope. Its unexpected exit is
    /// reported as a fault for this generation.
    pub fn spawn_service(&self, name: &str, program: &str, args: Vec<String>, to_appium_log: bool) -> Result<(), SetupError> {
        let log = if to_appium_log {
            self.logs.appium.clone()
        } else {
            self.logs.device.clone()
        };
        spawn_service(
            ServiceSpec {
                name: name.to_string(),
                program: program.to_string(),
                args,
                log,
            },
            self.scope.clone(),
            self.fault_reporter(),
        )?;
        Ok(())
    }

    /// Hands out a reporter for background monitors started during setup.
    pub fn fault_reporter(&self) -> impl Fn(String) + Send + Sync + 'static {
        let faults = self.faults.clone();
        let udid = self.udid().to_string();
        let generation = self.generation;
        move |reason| {
            let _ = faults.send(Fault {
                udid: udid.clone(),
                generation,
                reason,
            });
        }
    }

    /// Sleeps unless the scope is cancelled first.
    pub async fn pause(&self, duration: Duration) -> Result<(), SetupError> {
        tokio::select! {
            _ = self.scope.cancelled() => Err(SetupError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Launches the automation server for `target` and waits for it to answer.
pub async fn start_automation(ctx: &DeviceContext, appium: &str, target: &AppiumTarget<'_>) -> Result<(), SetupError> {
    ctx.spawn_service("appium", appium, target.args(), true)?;
    let ready = spawn_readiness_probe(
        ctx.http.clone(),
        format!("http://localhost:{}/status", target.port),
        ProbePolicy::AUTOMATION,
        ctx.scope.clone(),
    );
    await_ready(ready, "automation server", AUTOMATION_DEADLINE, &ctx.scope).await?;
    ctx.log(&format!("automation server ready on port {}", target.port));
    Ok(())
}

/// Registers the device's automation server as a grid relay node.
pub async fn start_grid_node(ctx: &DeviceContext, grid: &GridNode, target: &AppiumTarget<'_>) -> Result<(), SetupError> {
    let node_port = ctx.allocate_port(|p, port| p.grid = Some(port)).await?;
    let config_path = ctx.log_dir.join("grid-node.toml");
    tokio::fs::write(&config_path, grid_node_toml(target, node_port)?).await?;
    ctx.spawn_service(
        "grid-node",
        &grid.java,
        grid_node_args(&grid.jar, &config_path, &grid.url),
        false,
    )?;
    ctx.log(&format!("grid node registering with {}", grid.url));
    Ok(())
}
