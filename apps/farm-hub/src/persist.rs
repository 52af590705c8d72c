//! Keeps device and provider records in the record store across hub restarts.
//! Leases are never persisted.

use std::sync::Arc;
use std::time::Duration;

use farm_store::{DeviceStore, StoreError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::registry::Registry;

pub async fn seed_registry(registry: &Registry, store: &dyn DeviceStore) -> Result<(), StoreError> {
    let devices = store.list_devices().await?;
    let providers = store.list_providers().await?;
    info!(
        devices = devices.len(),
        providers = providers.len(),
        "seeding registry from store"
    );
    registry.seed(devices, providers);
    Ok(())
}

pub async fn snapshot_once(registry: &Registry, store: &dyn DeviceStore) -> Result<(), StoreError> {
    store.upsert_devices(&registry.device_records()).await?;
    for provider in registry.providers() {
        store.upsert_provider(&provider).await?;
    }
    Ok(())
}

pub fn spawn_snapshotter(
    registry: Arc<Registry>,
    store: Arc<dyn DeviceStore>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = snapshot_once(&registry, store.as_ref()).await {
                warn!(error = %err, "record snapshot failed");
            }
        }
    })
}
