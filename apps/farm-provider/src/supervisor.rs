//! Drives every configured device through `init → preparing → live`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use farm_proto::{now_millis, Device, DeviceOs, ProviderData, ProviderState, ProviderUpdate};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{device_log_dir, DeviceConfig, StreamSettings};
use crate::device::DeviceSlot;
use crate::logging::DeviceLogs;
use crate::platform::{DeviceContext, Fault, PlatformBackend, SetupError};
use crate::ports::PortAllocator;
use crate::probes::{spawn_liveness_monitor, LivenessPolicy};

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub tick: Duration,
    pub liveness: LivenessPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            liveness: LivenessPolicy::default(),
        }
    }
}

pub struct Supervisor {
    provider: ProviderData,
    slots: BTreeMap<String, Arc<DeviceSlot>>,
    backends: Vec<Arc<dyn PlatformBackend>>,
    ports: Arc<PortAllocator>,
    http: reqwest::Client,
    log_root: PathBuf,
    options: SupervisorOptions,
    faults: mpsc::UnboundedSender<Fault>,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<Fault>>>,
}

impl Supervisor {
    /// Devices whose OS has no backend are ignored.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: ProviderData,
        devices: Vec<DeviceConfig>,
        stream: StreamSettings,
        backends: Vec<Arc<dyn PlatformBackend>>,
        ports: Arc<PortAllocator>,
        http: reqwest::Client,
        log_root: PathBuf,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let mut slots = BTreeMap::new();
        for config in devices {
            if !backends.iter().any(|b| b.os() == config.os) {
                warn!(udid = %config.udid, os = %config.os, "no backend for device, skipping");
                continue;
            }
            let slot = DeviceSlot::new(config, stream, &provider.nickname);
            slots.insert(slot.udid().to_string(), Arc::new(slot));
        }
        let (faults, fault_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            provider,
            slots,
            backends,
            ports,
            http,
            log_root,
            options,
            faults,
            fault_rx: Mutex::new(Some(fault_rx)),
        })
    }

    pub fn slot(&self, udid: &str) -> Option<Arc<DeviceSlot>> {
        self.slots.get(udid).cloned()
    }

    pub fn backend(&self, os: DeviceOs) -> Option<Arc<dyn PlatformBackend>> {
        self.backends.iter().find(|b| b.os() == os).cloned()
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn nickname(&self) -> &str {
        &self.provider.nickname
    }

    /// Current device records, stamped for publication.
    pub fn snapshot(&self) -> Vec<Device> {
        let now = now_millis();
        let host = self.provider.advertised_host();
        self.slots
            .values()
            .map(|slot| {
                let mut device = slot.record();
                device.last_updated_timestamp = now;
                device.host = host.clone();
                device.provider = self.provider.nickname.clone();
                device
            })
            .collect()
    }

    pub fn provider_update(&self) -> ProviderUpdate {
        let mut provider = self.provider.clone();
        provider.last_updated = now_millis();
        ProviderUpdate {
            provider,
            device_data: self.snapshot(),
        }
    }

    /// Ticks enumeration and handles agent faults until `shutdown`, then
    /// resets every device.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut faults) = self.fault_rx.lock().take() else {
            warn!("supervisor loop already running");
            return;
        };
        let mut ticker = tokio::time::interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(devices = self.slots.len(), "device supervisor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.reconcile().await,
                Some(fault) = faults.recv() => self.on_fault(fault),
            }
        }
        for slot in self.slots.values() {
            self.reset(slot, None, "provider shutting down").await;
        }
        info!("device supervisor stopped");
    }

    /// One enumeration pass: start setup for newly present devices and reset
    /// devices that went away.
    pub async fn reconcile(self: &Arc<Self>) {
        for backend in &self.backends {
            let present = match backend.enumerate().await {
                Ok(present) => present,
                Err(err) => {
                    debug!(os = %backend.os(), error = %err, "enumeration failed");
                    continue;
                }
            };
            for slot in self.slots.values().filter(|s| s.os() == backend.os()) {
                if present.contains(slot.udid()) {
                    slot.set_connected(true);
                    if let Some((generation, scope)) = slot.begin_preparing() {
                        info!(udid = %slot.udid(), generation, "device attached, preparing");
                        tokio::spawn(self.clone().set_up(slot.clone(), backend.clone(), generation, scope));
                    }
                } else {
                    slot.set_connected(false);
                    let generation = slot.generation();
                    if slot.state() != ProviderState::Init && slot.claim_reset(generation) {
                        let this = self.clone();
                        let slot = slot.clone();
                        tokio::spawn(async move {
                            this.reset(&slot, Some(generation), "device disconnected").await;
                        });
                    }
                }
            }
        }
    }

    fn on_fault(self: &Arc<Self>, fault: Fault) {
        let Some(slot) = self.slot(&fault.udid) else {
            return;
        };
        if slot.generation() != fault.generation
            || slot.state() == ProviderState::Init
            || !slot.claim_reset(fault.generation)
        {
            debug!(udid = %fault.udid, generation = fault.generation, "ignoring stale fault");
            return;
        }
        warn!(udid = %fault.udid, reason = %fault.reason, "device agent failed");
        let this = self.clone();
        tokio::spawn(async move {
            this.reset(&slot, Some(fault.generation), &fault.reason).await;
        });
    }

    async fn set_up(
        self: Arc<Self>,
        slot: Arc<DeviceSlot>,
        backend: Arc<dyn PlatformBackend>,
        generation: u64,
        scope: CancellationToken,
    ) {
        let guard = slot.transition.lock().await;
        let result = tokio::select! {
            _ = scope.cancelled() => Err(SetupError::Cancelled),
            result = self.prepare(&slot, backend.as_ref(), generation, &scope) => result,
        };
        drop(guard);

        match result {
            Ok(ctx) => {
                if !slot.finish_preparing(generation) {
                    return;
                }
                info!(udid = %slot.udid(), "device live");
                if let Some(appium) = slot.ports().appium {
                    spawn_liveness_monitor(
                        self.http.clone(),
                        format!("http://localhost:{appium}/status"),
                        self.options.liveness,
                        scope,
                        ctx.fault_reporter(),
                    );
                }
            }
            Err(SetupError::Cancelled) => {
                debug!(udid = %slot.udid(), generation, "setup cancelled");
            }
            Err(err) => {
                warn!(udid = %slot.udid(), error = %err, "device setup failed");
                if let Some(logs) = slot.logs() {
                    crate::logging::write_line(&logs.device, "supervisor", &format!("setup failed: {err}"));
                }
                self.reset(&slot, Some(generation), "setup failed").await;
            }
        }
    }

    async fn prepare(
        &self,
        slot: &Arc<DeviceSlot>,
        backend: &dyn PlatformBackend,
        generation: u64,
        scope: &CancellationToken,
    ) -> Result<DeviceContext, SetupError> {
        let dir = device_log_dir(&self.log_root, slot.udid());
        let logs = Arc::new(DeviceLogs::open(&dir)?);
        slot.update(|rt| rt.logs = Some(logs.clone()));
        let ctx = DeviceContext::new(
            slot.clone(),
            generation,
            scope.clone(),
            logs,
            dir,
            self.http.clone(),
            self.ports.clone(),
            self.faults.clone(),
        );
        ctx.log(&format!("setup started (generation {generation})"));
        backend.prepare(&ctx).await?;
        ctx.log("setup finished");
        Ok(ctx)
    }

    /// Returns the device to `init`: cancels its scope first so a running
    /// setup aborts, then tears down under the transition lock. A reset for
    /// an older generation is a no-op.
    pub async fn reset(&self, slot: &Arc<DeviceSlot>, generation: Option<u64>, reason: &str) {
        if !slot.cancel_scope(generation) {
            return;
        }
        let _guard = slot.transition.lock().await;
        if generation.is_some_and(|g| g != slot.generation()) {
            return;
        }
        let ports = slot.clear_runtime();
        if let Some(backend) = self.backend(slot.os()) {
            backend.teardown(slot, ports).await;
        }
        self.ports.release_all(ports.all());
        info!(udid = %slot.udid(), reason, released = ports.all().len(), "device reset");
    }
}
