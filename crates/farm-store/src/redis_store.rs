use async_trait::async_trait;
use farm_proto::{Device, ProviderData};
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::{DeviceStore, StoreError};

const DEVICES_KEY: &str = "farm:devices";
const PROVIDERS_KEY: &str = "farm:providers";

/// Records live in two hashes, one JSON document per field.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Store(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Store(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn hash_values(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("HVALS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Store(e.to_string()))
    }
}

#[async_trait]
impl DeviceStore for RedisStore {
    async fn upsert_devices(&self, devices: &[Device]) -> Result<(), StoreError> {
        if devices.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for device in devices {
            pipe.hset(DEVICES_KEY, &device.udid, serde_json::to_string(device)?)
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let raw = self.hash_values(DEVICES_KEY).await?;
        Ok(decode_all(raw, "device"))
    }

    async fn upsert_provider(&self, provider: &ProviderData) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(PROVIDERS_KEY)
            .arg(&provider.nickname)
            .arg(serde_json::to_string(provider)?)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderData>, StoreError> {
        let raw = self.hash_values(PROVIDERS_KEY).await?;
        Ok(decode_all(raw, "provider"))
    }
}

/// Skips documents that no longer decode instead of failing the whole listing.
fn decode_all<T: serde::de::DeserializeOwned>(raw: Vec<String>, kind: &str) -> Vec<T> {
    raw.into_iter()
        .filter_map(|doc| match serde_json::from_str(&doc) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(error = %err, kind, "skipping undecodable stored record");
                None
            }
        })
        .collect()
}
