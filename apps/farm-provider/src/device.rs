//! Per-device runtime state owned by the supervisor.

use std::sync::Arc;

use farm_proto::{Device, DeviceOs, ProviderState};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{DeviceConfig, StreamSettings};
use crate::logging::DeviceLogs;

/// Host ports reserved for one device's agents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DevicePorts {
    pub appium: Option<u16>,
    pub stream: Option<u16>,
    pub wda: Option<u16>,
    pub wda_stream: Option<u16>,
    pub tunnel: Option<u16>,
    pub grid: Option<u16>,
}

impl DevicePorts {
    pub fn all(&self) -> Vec<u16> {
        [
            self.appium,
            self.stream,
            self.wda,
            self.wda_stream,
            self.tunnel,
            self.grid,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Userspace tunnel endpoint for iOS 17.4+ devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub address: String,
    pub rsd_port: u16,
}

pub struct DeviceRuntime {
    pub record: Device,
    pub ports: DevicePorts,
    pub scope: Option<CancellationToken>,
    pub generation: u64,
    pub wda_session_id: Option<String>,
    pub tunnel: Option<TunnelEndpoint>,
    pub logs: Option<Arc<DeviceLogs>>,
    /// Generation a teardown has already been scheduled for.
    reset_pending: Option<u64>,
}

pub struct DeviceSlot {
    pub config: DeviceConfig,
    pub stream: StreamSettings,
    runtime: Mutex<DeviceRuntime>,
    /// Serializes init/preparing/live transitions.
    pub(crate) transition: tokio::sync::Mutex<()>,
}

impl DeviceSlot {
    pub fn new(config: DeviceConfig, global_stream: StreamSettings, provider: &str) -> Self {
        let mut record = Device::new(config.udid.clone(), config.os);
        record.name = config.name.clone();
        record.usage = config.usage;
        record.workspace_id = config.workspace_id.clone();
        record.screen_width = config.screen_width;
        record.screen_height = config.screen_height;
        record.provider = provider.to_string();
        Self {
            stream: config.stream_settings(global_stream),
            config,
            runtime: Mutex::new(DeviceRuntime {
                record,
                ports: DevicePorts::default(),
                scope: None,
                generation: 0,
                wda_session_id: None,
                tunnel: None,
                logs: None,
                reset_pending: None,
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn udid(&self) -> &str {
        &self.config.udid
    }

    pub fn os(&self) -> DeviceOs {
        self.config.os
    }

    pub fn record(&self) -> Device {
        self.runtime.lock().record.clone()
    }

    pub fn state(&self) -> ProviderState {
        self.runtime.lock().record.provider_state
    }

    pub fn ports(&self) -> DevicePorts {
        self.runtime.lock().ports
    }

    pub fn generation(&self) -> u64 {
        self.runtime.lock().generation
    }

    pub fn wda_session_id(&self) -> Option<String> {
        self.runtime.lock().wda_session_id.clone()
    }

    pub fn tunnel(&self) -> Option<TunnelEndpoint> {
        self.runtime.lock().tunnel.clone()
    }

    pub fn logs(&self) -> Option<Arc<DeviceLogs>> {
        self.runtime.lock().logs.clone()
    }

    pub fn is_live(&self) -> bool {
        self.state() == ProviderState::Live
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceRuntime) -> R) -> R {
        f(&mut self.runtime.lock())
    }

    /// Moves an idle device to `preparing` with a fresh scope. `None` when the
    /// device is already preparing or live.
    pub(crate) fn begin_preparing(&self) -> Option<(u64, CancellationToken)> {
        let mut rt = self.runtime.lock();
        if rt.record.provider_state != ProviderState::Init {
            return None;
        }
        rt.generation += 1;
        let scope = CancellationToken::new();
        rt.scope = Some(scope.clone());
        rt.record.provider_state = ProviderState::Preparing;
        Some((rt.generation, scope))
    }

    /// Promotes to `live` if the setup that finished is still the current one.
    pub(crate) fn finish_preparing(&self, generation: u64) -> bool {
        let mut rt = self.runtime.lock();
        let current = rt.generation == generation
            && rt.record.provider_state == ProviderState::Preparing
            && rt.scope.as_ref().is_some_and(|s| !s.is_cancelled());
        if current {
            rt.record.provider_state = ProviderState::Live;
            rt.record.connected = true;
        }
        current
    }

    /// Cancels the current scope so in-flight setup steps and scoped children stop.
    pub(crate) fn cancel_scope(&self, generation: Option<u64>) -> bool {
        let rt = self.runtime.lock();
        if generation.is_some_and(|g| g != rt.generation) {
            return false;
        }
        if let Some(scope) = &rt.scope {
            scope.cancel();
        }
        true
    }

    /// Claims the teardown of `generation`. Only the first caller per
    /// generation gets `true`.
    pub(crate) fn claim_reset(&self, generation: u64) -> bool {
        let mut rt = self.runtime.lock();
        if rt.reset_pending == Some(generation) {
            return false;
        }
        rt.reset_pending = Some(generation);
        true
    }

    /// Clears every per-setup allocation and returns the ports to release.
    pub(crate) fn clear_runtime(&self) -> DevicePorts {
        let mut rt = self.runtime.lock();
        let ports = std::mem::take(&mut rt.ports);
        rt.scope = None;
        rt.wda_session_id = None;
        rt.tunnel = None;
        rt.logs = None;
        rt.reset_pending = None;
        rt.record.provider_state = ProviderState::Init;
        rt.record.connected = false;
        ports
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.runtime.lock().record.connected = connected;
    }
}
