use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use farm_proto::{Device, ProviderData};
use tokio::sync::Mutex;

use crate::{DeviceStore, StoreError};

/// In-memory adapter for tests and store-less deployments.
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<String, Device>>,
    providers: Mutex<BTreeMap<String, ProviderData>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_devices(&self, devices: &[Device]) -> Result<(), StoreError> {
        let mut guard = self.devices.lock().await;
        for device in devices {
            guard.insert(device.udid.clone(), device.clone());
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.devices.lock().await.values().cloned().collect())
    }

    async fn upsert_provider(&self, provider: &ProviderData) -> Result<(), StoreError> {
        self.providers
            .lock()
            .await
            .insert(provider.nickname.clone(), provider.clone());
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderData>, StoreError> {
        Ok(self.providers.lock().await.values().cloned().collect())
    }
}
