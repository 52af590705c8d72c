//! Persistence for device and provider records.
//!
//! Both binaries talk to a [`DeviceStore`]; the concrete backend is chosen from
//! the `--store-url` flag by [`build_store`].

use std::sync::Arc;

use async_trait::async_trait;
use farm_proto::{Device, ProviderData};
use tracing::{info, warn};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Store(String),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Replaces stored records by `udid`.
    async fn upsert_devices(&self, devices: &[Device]) -> Result<(), StoreError>;

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Replaces the stored record by `nickname`.
    async fn upsert_provider(&self, provider: &ProviderData) -> Result<(), StoreError>;

    async fn list_providers(&self) -> Result<Vec<ProviderData>, StoreError>;

    /// Devices whose `provider` field names the given nickname.
    async fn devices_for_provider(&self, nickname: &str) -> Result<Vec<Device>, StoreError> {
        let devices = self.list_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|d| d.provider == nickname)
            .collect())
    }
}

/// Builds the configured backend, falling back to memory when the URL is absent,
/// malformed, or unreachable.
pub async fn build_store(url: Option<&str>) -> Arc<dyn DeviceStore> {
    let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
        info!("no store configured; using in-memory records");
        return MemoryStore::new();
    };
    match RedisStore::connect(url).await {
        Ok(store) => {
            info!(url = %url, "using redis record store");
            Arc::new(store)
        }
        Err(err) => {
            warn!(error = %err, url = %url, "record store unavailable; falling back to memory");
            MemoryStore::new()
        }
    }
}
