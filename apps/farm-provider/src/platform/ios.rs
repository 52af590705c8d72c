//! iOS devices driven through the go-ios CLI and WebDriverAgent.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use farm_proto::DeviceOs;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{start_automation, start_grid_node, DeviceContext, GridNode, PlatformBackend, SetupError};
use crate::actions::{hold_actions, swipe_actions, tap_actions, w3c_value, ActionError, ActionOutput, DeviceAction};
use crate::appium::AppiumTarget;
use crate::config::ProviderConfig;
use crate::device::{DeviceSlot, TunnelEndpoint};
use crate::probes::{await_ready, spawn_readiness_probe, ProbePolicy, WDA_DEADLINE};
use crate::tools::{Tool, ToolError};

const CMD_TIMEOUT: Duration = Duration::from_secs(30);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(300);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);
const TUNNEL_DEADLINE: Duration = Duration::from_secs(30);
const WDA_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEVICE_WDA_PORT: u16 = 8100;
const DEVICE_STREAM_PORT: u16 = 9500;
const DEVICE_WDA_STREAM_PORT: u16 = 9100;

/// `major.minor` of an iOS release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IosVersion {
    pub major: u64,
    pub minor: u64,
}

impl IosVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
        Some(Self { major, minor })
    }

    pub fn needs_developer_mode(self) -> bool {
        self.major >= 16
    }

    pub fn needs_tunnel(self) -> bool {
        self >= Self { major: 17, minor: 4 }
    }

    /// 17.0 through 17.3 cannot install and start WDA by themselves, so the
    /// runner must already be on the device.
    pub fn launches_preinstalled_wda(self) -> bool {
        self.major == 17 && self.minor < 4
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceInfo {
    #[serde(default)]
    product_version: String,
    #[serde(default)]
    product_type: String,
    #[serde(default)]
    device_name: String,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(rename = "deviceList", default)]
    device_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelInfo {
    address: String,
    rsd_port: u16,
}

pub struct IosBackend {
    ios: Tool,
    appium: String,
    wda_bundle_id: String,
    wda_ipa: PathBuf,
    image_dir: PathBuf,
    supervision: Option<(PathBuf, String)>,
    grid: Option<GridNode>,
    http: reqwest::Client,
}

impl IosBackend {
    pub fn new(config: &ProviderConfig, http: reqwest::Client) -> Self {
        let settings = &config.settings;
        let supervision = match (&settings.supervision_profile, &settings.supervision_password) {
            (Some(profile), Some(password)) if !password.is_empty() => {
                Some((config.asset(profile), password.clone()))
            }
            _ => None,
        };
        Self {
            ios: Tool::new(settings.binaries.ios.clone()),
            appium: settings.binaries.appium.clone(),
            wda_bundle_id: settings.wda_bundle_id.clone(),
            wda_ipa: config.asset(&settings.wda_ipa),
            image_dir: config.folder.join("devimages"),
            supervision,
            grid: settings.grid_url().map(|url| GridNode {
                url: url.to_string(),
                jar: config.asset(&settings.selenium_jar),
                java: settings.binaries.java.clone(),
            }),
            http,
        }
    }

    async fn run(&self, udid: &str, tunnel: Option<&TunnelEndpoint>, args: &[&str], timeout: Duration) -> Result<String, ToolError> {
        self.ios.run(&device_args(udid, tunnel, args), timeout).await
    }

    async fn pair(&self, ctx: &DeviceContext) -> Result<(), SetupError> {
        let udid = ctx.udid();
        if let Some((profile, password)) = &self.supervision {
            let p12 = format!("--p12file={}", profile.display());
            let pw = format!("--password={password}");
            match self.run(udid, None, &["pair", &p12, &pw], CMD_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(udid, error = %err, "supervised pairing failed, falling back");
                    ctx.log("supervised pairing failed, trying unsupervised");
                }
            }
        }
        self.run(udid, None, &["pair"], CMD_TIMEOUT).await?;
        Ok(())
    }

    async fn info(&self, udid: &str, tunnel: Option<&TunnelEndpoint>) -> Result<DeviceInfo, SetupError> {
        let out = self.run(udid, tunnel, &["info"], CMD_TIMEOUT).await?;
        serde_json::from_str(&out).map_err(|err| SetupError::Parse(format!("ios info: {err}")))
    }

    async fn open_tunnel(&self, ctx: &DeviceContext) -> Result<TunnelEndpoint, SetupError> {
        let info_port = ctx.allocate_port(|p, port| p.tunnel = Some(port)).await?;
        let mut args = device_args(ctx.udid(), None, &["tunnel", "start", "--userspace"]);
        args.push(format!("--tunnel-info-port={info_port}"));
        ctx.spawn_service("tunnel", self.ios.program(), args, false)?;

        let url = format!("http://127.0.0.1:{info_port}/tunnel/{}", ctx.udid());
        let started = tokio::time::Instant::now();
        loop {
            if let Ok(response) = self.http.get(&url).timeout(Duration::from_secs(2)).send().await {
                if response.status().is_success() {
                    if let Ok(info) = response.json::<TunnelInfo>().await {
                        return Ok(TunnelEndpoint {
                            address: info.address,
                            rsd_port: info.rsd_port,
                        });
                    }
                }
            }
            if started.elapsed() >= TUNNEL_DEADLINE {
                return Err(SetupError::NotReady {
                    what: "userspace tunnel",
                    deadline: TUNNEL_DEADLINE,
                });
            }
            ctx.pause(Duration::from_secs(1)).await?;
        }
    }

    async fn create_wda_session(&self, wda_port: u16) -> Result<String, SetupError> {
        let body: Value = self
            .http
            .post(format!("http://localhost:{wda_port}/session"))
            .timeout(WDA_REQUEST_TIMEOUT)
            .json(&json!({ "capabilities": { "firstMatch": [{}], "alwaysMatch": {} } }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        session_id_of(&body).ok_or_else(|| SetupError::Parse(format!("WDA session response: {body}")))
    }

    async fn apply_stream_settings(&self, ctx: &DeviceContext, wda_port: u16, session: &str) -> Result<(), SetupError> {
        let stream = ctx.slot.stream;
        self.http
            .post(format!("http://localhost:{wda_port}/session/{session}/appium/settings"))
            .timeout(WDA_REQUEST_TIMEOUT)
            .json(&json!({
                "settings": {
                    "mjpegServerFramerate": stream.fps,
                    "mjpegServerScreenshotQuality": stream.jpeg_quality,
                    "mjpegScalingFactor": stream.scaling_factor,
                }
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn wda(&self, slot: &DeviceSlot) -> Result<(String, String), ActionError> {
        let port = slot
            .ports()
            .wda
            .ok_or_else(|| ActionError::NotLive(slot.udid().to_string()))?;
        let session = slot
            .wda_session_id()
            .ok_or_else(|| ActionError::NotLive(slot.udid().to_string()))?;
        Ok((format!("http://localhost:{port}"), session))
    }

    async fn wda_call(&self, method: reqwest::Method, url: String, body: Option<Value>) -> Result<Value, ActionError> {
        let mut request = self.http.request(method, url).timeout(WDA_REQUEST_TIMEOUT);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ActionError::Agent {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| ActionError::Parse(err.to_string()))
    }
}

fn device_args(udid: &str, tunnel: Option<&TunnelEndpoint>, args: &[&str]) -> Vec<String> {
    let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    full.push(format!("--udid={udid}"));
    if let Some(tunnel) = tunnel {
        full.push(format!("--address={}", tunnel.address));
        full.push(format!("--rsd-port={}", tunnel.rsd_port));
    }
    full
}

fn session_id_of(body: &Value) -> Option<String> {
    body.pointer("/value/sessionId")
        .or_else(|| body.get("sessionId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl PlatformBackend for IosBackend {
    fn os(&self) -> DeviceOs {
        DeviceOs::Ios
    }

    async fn enumerate(&self) -> Result<HashSet<String>, SetupError> {
        let out = self.ios.run(&["list"], CMD_TIMEOUT).await?;
        parse_device_list(&out)
    }

    async fn prepare(&self, ctx: &DeviceContext) -> Result<(), SetupError> {
        let udid = ctx.udid().to_string();
        self.pair(ctx).await?;

        let info = self.info(&udid, None).await?;
        let version = IosVersion::parse(&info.product_version)
            .ok_or_else(|| SetupError::Parse(format!("ProductVersion {:?}", info.product_version)))?;

        if version.needs_developer_mode() {
            let out = self.run(&udid, None, &["devmode", "get"], CMD_TIMEOUT).await?;
            if !developer_mode_enabled(&out) {
                return Err(SetupError::DeveloperModeDisabled);
            }
        }

        let basedir = format!("--basedir={}", self.image_dir.display());
        self.run(&udid, None, &["image", "auto", &basedir], IMAGE_TIMEOUT)
            .await?;

        ctx.update(|rt| {
            rt.record.os_version = info.product_version.clone();
            rt.record.hardware_model = info.product_type.clone();
            rt.record.model = model_name(&info.product_type)
                .map(str::to_string)
                .unwrap_or_else(|| info.product_type.clone());
            if rt.record.name.is_empty() {
                rt.record.name = info.device_name.clone();
            }
            if rt.record.screen_width.is_none() || rt.record.screen_height.is_none() {
                if let Some((w, h)) = screen_size(&info.product_type) {
                    rt.record.screen_width = Some(w);
                    rt.record.screen_height = Some(h);
                }
            }
        });

        let appium_port = ctx.allocate_port(|p, port| p.appium = Some(port)).await?;
        let wda_port = ctx.allocate_port(|p, port| p.wda = Some(port)).await?;
        let wda_stream_port = ctx.allocate_port(|p, port| p.wda_stream = Some(port)).await?;
        let stream_port = ctx.allocate_port(|p, port| p.stream = Some(port)).await?;

        let tunnel = if version.needs_tunnel() {
            let endpoint = self.open_tunnel(ctx).await?;
            ctx.log(&format!("tunnel up at {}:{}", endpoint.address, endpoint.rsd_port));
            ctx.update(|rt| rt.tunnel = Some(endpoint.clone()));
            Some(endpoint)
        } else {
            None
        };
        let tunnel = tunnel.as_ref();

        for (name, host, device) in [
            ("forward-wda", wda_port, DEVICE_WDA_PORT),
            ("forward-stream", stream_port, DEVICE_STREAM_PORT),
            ("forward-wda-stream", wda_stream_port, DEVICE_WDA_STREAM_PORT),
        ] {
            let (host, device) = (host.to_string(), device.to_string());
            let args = device_args(&udid, tunnel, &["forward", &host, &device]);
            ctx.spawn_service(name, self.ios.program(), args, false)?;
        }

        if version.launches_preinstalled_wda() {
            self.run(&udid, tunnel, &["launch", &self.wda_bundle_id], CMD_TIMEOUT)
                .await?;
        } else {
            let path = format!("--path={}", self.wda_ipa.display());
            self.run(&udid, tunnel, &["install", &path], INSTALL_TIMEOUT)
                .await?;
            let bundle = format!("--bundleid={}", self.wda_bundle_id);
            let runner = format!("--testrunnerbundleid={}", self.wda_bundle_id);
            let args = device_args(
                &udid,
                tunnel,
                &["runwda", &bundle, &runner, "--xctestconfig=WebDriverAgentRunner.xctest"],
            );
            ctx.spawn_service("wda", self.ios.program(), args, false)?;
        }

        let ready = spawn_readiness_probe(
            ctx.http.clone(),
            format!("http://localhost:{wda_port}/status"),
            ProbePolicy::WDA,
            ctx.scope.clone(),
        );
        await_ready(ready, "WebDriverAgent", WDA_DEADLINE, &ctx.scope).await?;

        let session = self.create_wda_session(wda_port).await?;
        self.apply_stream_settings(ctx, wda_port, &session).await?;
        ctx.update(|rt| rt.wda_session_id = Some(session.clone()));
        debug!(udid = %udid, session = %session, "WDA session created");

        let record = ctx.slot.record();
        let target = AppiumTarget {
            udid: &udid,
            os: DeviceOs::Ios,
            os_version: &record.os_version,
            name: &record.name,
            port: appium_port,
            wda_port: Some(wda_port),
            wda_stream_port: Some(wda_stream_port),
        };
        start_automation(ctx, &self.appium, &target).await?;
        if let Some(grid) = &self.grid {
            start_grid_node(ctx, grid, &target).await?;
        }
        Ok(())
    }

    async fn perform(&self, slot: &DeviceSlot, action: DeviceAction) -> Result<ActionOutput, ActionError> {
        let (base, session) = self.wda(slot)?;
        let scoped = |path: &str| format!("{base}/session/{session}{path}");
        let post = reqwest::Method::POST;
        match action {
            DeviceAction::Home => {
                self.wda_call(post, format!("{base}/wda/homescreen"), None).await?;
            }
            DeviceAction::Lock => {
                self.wda_call(post, scoped("/wda/lock"), None).await?;
            }
            DeviceAction::Unlock => {
                self.wda_call(post, scoped("/wda/unlock"), None).await?;
            }
            DeviceAction::Tap { x, y } => {
                self.wda_call(post, scoped("/actions"), Some(tap_actions(x, y)))
                    .await?;
            }
            DeviceAction::Swipe {
                x,
                y,
                end_x,
                end_y,
                duration_ms,
            } => {
                let body = swipe_actions(x, y, end_x, end_y, duration_ms);
                self.wda_call(post, scoped("/actions"), Some(body)).await?;
            }
            DeviceAction::TouchAndHold { x, y, duration_ms } => {
                let body = hold_actions(x, y, duration_ms);
                self.wda_call(post, scoped("/actions"), Some(body)).await?;
            }
            DeviceAction::TypeText(text) => {
                let chars: Vec<String> = text.chars().map(String::from).collect();
                self.wda_call(post, scoped("/wda/keys"), Some(json!({ "value": chars })))
                    .await?;
            }
            DeviceAction::Clear => {
                let deletes = vec!["\u{8}"; 100];
                self.wda_call(post, scoped("/wda/keys"), Some(json!({ "value": deletes })))
                    .await?;
            }
            DeviceAction::Screenshot => {
                let body = self
                    .wda_call(reqwest::Method::GET, format!("{base}/screenshot"), None)
                    .await?;
                return text_value(&body);
            }
            DeviceAction::Source => {
                let body = self
                    .wda_call(reqwest::Method::GET, format!("{base}/source"), None)
                    .await?;
                return text_value(&body);
            }
            DeviceAction::GetClipboard => {
                let body = self
                    .wda_call(
                        post,
                        scoped("/wda/getPasteboard"),
                        Some(json!({ "contentType": "plaintext" })),
                    )
                    .await?;
                let encoded = w3c_value(&body).and_then(Value::as_str).unwrap_or_default();
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|err| ActionError::Parse(err.to_string()))?;
                return Ok(ActionOutput::Text(String::from_utf8_lossy(&raw).into_owned()));
            }
        }
        Ok(ActionOutput::Done)
    }
}

fn text_value(body: &Value) -> Result<ActionOutput, ActionError> {
    w3c_value(body)
        .and_then(Value::as_str)
        .map(|s| ActionOutput::Text(s.to_string()))
        .ok_or_else(|| ActionError::Parse(format!("missing value in {body}")))
}

pub fn parse_device_list(out: &str) -> Result<HashSet<String>, SetupError> {
    let list: DeviceList = serde_json::from_str(out.trim())
        .map_err(|err| SetupError::Parse(format!("ios list: {err}")))?;
    Ok(list.device_list.into_iter().collect())
}

pub fn developer_mode_enabled(out: &str) -> bool {
    out.to_ascii_lowercase().contains("true")
}

/// Logical screen size in points by product type.
pub fn screen_size(product_type: &str) -> Option<(u32, u32)> {
    PRODUCTS
        .iter()
        .find(|p| p.0 == product_type)
        .map(|p| (p.2, p.3))
}

pub fn model_name(product_type: &str) -> Option<&'static str> {
    PRODUCTS.iter().find(|p| p.0 == product_type).map(|p| p.1)
}

const PRODUCTS: &[(&str, &str, u32, u32)] = &[
    ("iPhone10,1", "iPhone 8", 375, 667),
    ("iPhone10,4", "iPhone 8", 375, 667),
    ("iPhone10,2", "iPhone 8 Plus", 414, 736),
    ("iPhone10,5", "iPhone 8 Plus", 414, 736),
    ("iPhone10,3", "iPhone X", 375, 812),
    ("iPhone10,6", "iPhone X", 375, 812),
    ("iPhone11,2", "iPhone XS", 375, 812),
    ("iPhone11,4", "iPhone XS Max", 414, 896),
    ("iPhone11,6", "iPhone XS Max", 414, 896),
    ("iPhone11,8", "iPhone XR", 414, 896),
    ("iPhone12,1", "iPhone 11", 414, 896),
    ("iPhone12,3", "iPhone 11 Pro", 375, 812),
    ("iPhone12,5", "iPhone 11 Pro Max", 414, 896),
    ("iPhone12,8", "iPhone SE (2nd generation)", 375, 667),
    ("iPhone13,1", "iPhone 12 mini", 375, 812),
    ("iPhone13,2", "iPhone 12", 390, 844),
    ("iPhone13,3", "iPhone 12 Pro", 390, 844),
    ("iPhone13,4", "iPhone 12 Pro Max", 428, 926),
    ("iPhone14,4", "iPhone 13 mini", 375, 812),
    ("iPhone14,5", "iPhone 13", 390, 844),
    ("iPhone14,2", "iPhone 13 Pro", 390, 844),
    ("iPhone14,3", "iPhone 13 Pro Max", 428, 926),
    ("iPhone14,6", "iPhone SE (3rd generation)", 375, 667),
    ("iPhone14,7", "iPhone 14", 390, 844),
    ("iPhone14,8", "iPhone 14 Plus", 428, 926),
    ("iPhone15,2", "iPhone 14 Pro", 393, 852),
    ("iPhone15,3", "iPhone 14 Pro Max", 430, 932),
    ("iPhone15,4", "iPhone 15", 393, 852),
    ("iPhone15,5", "iPhone 15 Plus", 430, 932),
    ("iPhone16,1", "iPhone 15 Pro", 393, 852),
    ("iPhone16,2", "iPhone 15 Pro Max", 430, 932),
    ("iPhone17,3", "iPhone 16", 393, 852),
    ("iPhone17,4", "iPhone 16 Plus", 430, 932),
    ("iPhone17,1", "iPhone 16 Pro", 402, 874),
    ("iPhone17,2", "iPhone 16 Pro Max", 440, 956),
];
