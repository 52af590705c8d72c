use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::Device;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderData {
    pub nickname: String,
    #[serde(default)]
    pub host_address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub provide_android: bool,
    #[serde(default)]
    pub provide_ios: bool,
    #[serde(default)]
    pub use_selenium_grid: bool,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderData {
    pub fn new(nickname: impl Into<String>, host_address: impl Into<String>, port: u16) -> Self {
        Self {
            nickname: nickname.into(),
            host_address: host_address.into(),
            port,
            provide_android: false,
            provide_ios: false,
            use_selenium_grid: false,
            last_updated: 0,
            extra: Map::new(),
        }
    }

    /// `host:port` other processes use to reach this provider.
    pub fn advertised_host(&self) -> String {
        format!("{}:{}", self.host_address, self.port)
    }
}

/// Heartbeat payload posted to the hub's `/provider-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUpdate {
    pub provider: ProviderData,
    #[serde(default)]
    pub device_data: Vec<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceOs;

    #[test_timeout::timeout]
    fn update_decodes_without_device_list() {
        let update: ProviderUpdate =
            serde_json::from_str(r#"{"provider":{"nickname":"lab-1","port":10001}}"#).unwrap();
        assert_eq!(update.provider.nickname, "lab-1");
        assert!(update.device_data.is_empty());
    }

    #[test_timeout::timeout]
    fn advertised_host_joins_address_and_port() {
        let mut provider = ProviderData::new("lab-1", "192.168.1.20", 10001);
        provider.provide_ios = true;
        assert_eq!(provider.advertised_host(), "192.168.1.20:10001");

        let update = ProviderUpdate {
            provider,
            device_data: vec![Device::new("X", DeviceOs::Ios)],
        };
        let encoded = serde_json::to_value(&update).unwrap();
        assert_eq!(encoded["device_data"][0]["os"], "ios");
        assert_eq!(encoded["provider"]["provide_ios"], true);
    }
}
