use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOs {
    Ios,
    Android,
}

impl DeviceOs {
    /// Maps a W3C `platformName` value, ignoring case.
    pub fn from_platform_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ios" => Some(DeviceOs::Ios),
            "android" => Some(DeviceOs::Android),
            _ => None,
        }
    }

    /// Maps an Appium `automationName` to the platform it drives.
    pub fn from_automation_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "xcuitest" => Some(DeviceOs::Ios),
            "uiautomator2" => Some(DeviceOs::Android),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceOs::Ios => "ios",
            DeviceOs::Android => "android",
        }
    }
}

impl fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intent for a device. Only `Enabled` devices take automation sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceUsage {
    #[default]
    Enabled,
    Control,
    Disabled,
}

impl DeviceUsage {
    pub fn allows_automation(self) -> bool {
        matches!(self, DeviceUsage::Enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    #[default]
    Init,
    Preparing,
    Live,
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderState::Init => "init",
            ProviderState::Preparing => "preparing",
            ProviderState::Live => "live",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub udid: String,
    pub os: DeviceOs,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub hardware_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,

    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub usage: DeviceUsage,

    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub provider_state: ProviderState,
    #[serde(default)]
    pub last_updated_timestamp: i64,
    #[serde(default)]
    pub installed_apps: Vec<String>,

    /// Fields written by newer peers; echoed back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    pub fn new(udid: impl Into<String>, os: DeviceOs) -> Self {
        Self {
            udid: udid.into(),
            os,
            os_version: String::new(),
            name: String::new(),
            model: String::new(),
            hardware_model: String::new(),
            screen_width: None,
            screen_height: None,
            provider: String::new(),
            host: String::new(),
            workspace_id: String::new(),
            usage: DeviceUsage::Enabled,
            connected: false,
            provider_state: ProviderState::Init,
            last_updated_timestamp: 0,
            installed_apps: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_fresh(&self, now_ms: i64, window_ms: i64) -> bool {
        self.last_updated_timestamp >= now_ms - window_ms
    }

    /// Base URL of the owning provider, tolerating hosts that already carry a scheme.
    pub fn provider_base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }
}
