use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use farm_proto::{Device, DeviceOs, DeviceUsage};
use serde::Deserialize;

use crate::logging::LogLevel;

pub const SETTINGS_FILE: &str = "provider.toml";

/// Per-device log directory under the provider folder.
pub fn device_log_dir(folder: &Path, udid: &str) -> PathBuf {
    folder.join(format!("device_{udid}"))
}

#[derive(Debug, Parser)]
#[command(
    name = "farm-provider",
    author,
    version,
    about = "Device farm provider: supervises attached devices and reports them to the hub"
)]
pub struct Cli {
    /// Port for the per-device HTTP surface.
    #[arg(long, env = "FARM_PROVIDER_PORT", default_value_t = 10001)]
    pub port: u16,

    /// Unique provider name registered with the hub.
    #[arg(long, env = "FARM_PROVIDER_NICKNAME")]
    pub nickname: String,

    /// Hub base URL, e.g. `http://hub.local:4444`.
    #[arg(long, env = "FARM_PROVIDER_HUB")]
    pub hub: String,

    /// Working folder holding `provider.toml`, assets and logs.
    #[arg(long, env = "FARM_PROVIDER_FOLDER", default_value = ".")]
    pub provider_folder: PathBuf,

    /// Record store URL (`redis://…`); device records come from `provider.toml` only when unset.
    #[arg(long = "store-url", alias = "mongo-db", env = "FARM_PROVIDER_STORE_URL")]
    pub store_url: Option<String>,

    #[arg(long, value_enum, env = "FARM_PROVIDER_LOG_LEVEL", default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Address advertised to the hub for reaching this provider.
    #[arg(long, env = "FARM_PROVIDER_HOST_ADDRESS", default_value = "127.0.0.1")]
    pub host_address: String,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub port: u16,
    pub nickname: String,
    pub hub_url: String,
    pub folder: PathBuf,
    pub store_url: Option<String>,
    pub log_level: LogLevel,
    pub host_address: String,
    pub settings: ProviderSettings,
}

impl ProviderConfig {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if cli.nickname.trim().is_empty() {
            anyhow::bail!("--nickname must not be empty");
        }
        let hub_url = cli.hub.trim().trim_end_matches('/').to_string();
        if !(hub_url.starts_with("http://") || hub_url.starts_with("https://")) {
            anyhow::bail!("--hub must be an http(s) URL, got {}", cli.hub);
        }
        std::fs::create_dir_all(&cli.provider_folder).with_context(|| {
            format!("create provider folder {}", cli.provider_folder.display())
        })?;
        let settings = ProviderSettings::load(&cli.provider_folder)?;
        Ok(Self {
            port: cli.port,
            nickname: cli.nickname,
            hub_url,
            folder: cli.provider_folder,
            store_url: cli.store_url,
            log_level: cli.log_level,
            host_address: cli.host_address,
            settings,
        })
    }

    pub fn log_file(&self) -> PathBuf {
        self.folder.join("provider.log")
    }

    /// Resolves asset paths relative to the provider folder.
    pub fn asset(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.folder.join(path)
        }
    }
}

/// Settings from `<provider-folder>/provider.toml`, overridable by
/// `FARM_PROVIDER__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub provide_android: bool,
    #[serde(default)]
    pub provide_ios: bool,
    #[serde(default)]
    pub use_selenium_grid: bool,
    #[serde(default)]
    pub selenium_grid: Option<String>,
    #[serde(default = "default_selenium_jar")]
    pub selenium_jar: PathBuf,
    #[serde(default = "default_wda_bundle_id")]
    pub wda_bundle_id: String,
    #[serde(default = "default_wda_ipa")]
    pub wda_ipa: PathBuf,
    #[serde(default = "default_stream_apk")]
    pub stream_apk: PathBuf,
    #[serde(default = "default_stream_package")]
    pub stream_package: String,
    #[serde(default)]
    pub supervision_profile: Option<PathBuf>,
    #[serde(default)]
    pub supervision_password: Option<String>,
    #[serde(default)]
    pub binaries: Binaries,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default = "default_mjpeg_cap")]
    pub mjpeg_max_frame_bytes: usize,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provide_android: false,
            provide_ios: false,
            use_selenium_grid: false,
            selenium_grid: None,
            selenium_jar: default_selenium_jar(),
            wda_bundle_id: default_wda_bundle_id(),
            wda_ipa: default_wda_ipa(),
            stream_apk: default_stream_apk(),
            stream_package: default_stream_package(),
            supervision_profile: None,
            supervision_password: None,
            binaries: Binaries::default(),
            stream: StreamSettings::default(),
            mjpeg_max_frame_bytes: default_mjpeg_cap(),
            devices: Vec::new(),
        }
    }
}

impl ProviderSettings {
    pub fn load(folder: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(folder.join(SETTINGS_FILE)).required(false))
            .add_source(
                config::Environment::with_prefix("FARM_PROVIDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn provides(&self, os: DeviceOs) -> bool {
        match os {
            DeviceOs::Android => self.provide_android,
            DeviceOs::Ios => self.provide_ios,
        }
    }

    /// Grid integration needs both the flag and a hub URL to register with.
    pub fn grid_url(&self) -> Option<&str> {
        if self.use_selenium_grid {
            self.selenium_grid.as_deref().filter(|u| !u.is_empty())
        } else {
            None
        }
    }

    /// Merges stored records with file entries; file entries win.
    pub fn merge_stored(&mut self, stored: Vec<Device>) {
        for device in stored {
            if self.devices.iter().any(|d| d.udid == device.udid) {
                continue;
            }
            self.devices.push(DeviceConfig::from_record(&device));
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Binaries {
    #[serde(default = "default_adb")]
    pub adb: String,
    #[serde(default = "default_ios")]
    pub ios: String,
    #[serde(default = "default_appium")]
    pub appium: String,
    #[serde(default = "default_java")]
    pub java: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            adb: default_adb(),
            ios: default_ios(),
            appium: default_appium(),
            java: default_java(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            jpeg_quality: default_jpeg_quality(),
            scaling_factor: default_scaling_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub udid: String,
    pub os: DeviceOs,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub usage: DeviceUsage,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub screen_width: Option<u32>,
    #[serde(default)]
    pub screen_height: Option<u32>,
    #[serde(default)]
    pub stream: Option<StreamSettings>,
}

impl DeviceConfig {
    fn from_record(device: &Device) -> Self {
        Self {
            udid: device.udid.clone(),
            os: device.os,
            name: device.name.clone(),
            usage: device.usage,
            workspace_id: device.workspace_id.clone(),
            screen_width: device.screen_width,
            screen_height: device.screen_height,
            stream: None,
        }
    }

    pub fn stream_settings(&self, global: StreamSettings) -> StreamSettings {
        self.stream.unwrap_or(global)
    }
}

fn default_selenium_jar() -> PathBuf {
    PathBuf::from("selenium-server.jar")
}

fn default_wda_bundle_id() -> String {
    "com.facebook.WebDriverAgentRunner.xctrunner".into()
}

fn default_wda_ipa() -> PathBuf {
    PathBuf::from("WebDriverAgent.ipa")
}

fn default_stream_apk() -> PathBuf {
    PathBuf::from("farm-stream.apk")
}

fn default_stream_package() -> String {
    "com.farm.stream".into()
}

fn default_mjpeg_cap() -> usize {
    4 * 1024 * 1024
}

fn default_adb() -> String {
    "adb".into()
}

fn default_ios() -> String {
    "ios".into()
}

fn default_appium() -> String {
    "appium".into()
}

fn default_java() -> String {
    "java".into()
}

fn default_fps() -> u32 {
    15
}

fn default_jpeg_quality() -> u32 {
    75
}

fn default_scaling_factor() -> u32 {
    50
}
