//! Android devices driven through `adb`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use farm_proto::DeviceOs;
use tracing::debug;

use super::{start_automation, start_grid_node, DeviceContext, GridNode, PlatformBackend, SetupError};
use crate::actions::{adb_input_text, ActionError, ActionOutput, DeviceAction};
use crate::appium::AppiumTarget;
use crate::config::ProviderConfig;
use crate::device::{DevicePorts, DeviceSlot};
use crate::tools::{Tool, ToolError};

const CMD_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);
const AGENT_SETTLE: Duration = Duration::from_secs(3);
/// Device-side port the stream agent listens on.
const STREAM_AGENT_PORT: u16 = 1991;
/// Answers the clipboard broadcast. Setup removes it and the automation
/// server reinstalls it when a session starts.
const SETTINGS_PACKAGE: &str = "io.appium.settings";
const AUTOMATION_HELPERS: [&str; 3] = [
    SETTINGS_PACKAGE,
    "io.appium.uiautomator2.server",
    "io.appium.uiautomator2.server.test",
];
const DUMP_PATH: &str = "/sdcard/window_dump.xml";

pub struct AndroidBackend {
    adb: Tool,
    appium: String,
    stream_apk: PathBuf,
    stream_package: String,
    grid: Option<GridNode>,
}

impl AndroidBackend {
    pub fn new(config: &ProviderConfig) -> Self {
        let settings = &config.settings;
        Self {
            adb: Tool::new(settings.binaries.adb.clone()),
            appium: settings.binaries.appium.clone(),
            stream_apk: config.asset(&settings.stream_apk),
            stream_package: settings.stream_package.clone(),
            grid: settings.grid_url().map(|url| GridNode {
                url: url.to_string(),
                jar: config.asset(&settings.selenium_jar),
                java: settings.binaries.java.clone(),
            }),
        }
    }

    async fn on_device(&self, udid: &str, args: &[&str]) -> Result<String, ToolError> {
        self.adb.run(&device_args(udid, args), CMD_TIMEOUT).await
    }

    async fn shell(&self, udid: &str, args: &[&str]) -> Result<String, ToolError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.on_device(udid, &full).await
    }

    async fn getprop(&self, udid: &str, key: &str) -> Result<String, SetupError> {
        Ok(self.shell(udid, &["getprop", key]).await?)
    }

    async fn reinstall_stream_agent(&self, ctx: &DeviceContext) -> Result<(), SetupError> {
        let udid = ctx.udid();
        let pkg = self.stream_package.as_str();
        let listed = self.shell(udid, &["pm", "list", "packages", pkg]).await?;
        if parse_packages(&listed).iter().any(|p| p == pkg) {
            ctx.log("stream agent already installed, removing it");
            let service = format!("{pkg}/.StreamService");
            if let Err(err) = self.shell(udid, &["am", "stopservice", "-n", &service]).await {
                debug!(udid, error = %err, "stopping stream service failed");
            }
            ctx.pause(AGENT_SETTLE).await?;
            self.on_device(udid, &["uninstall", pkg]).await?;
            ctx.pause(AGENT_SETTLE).await?;
        }

        let apk = self.stream_apk.display().to_string();
        self.adb
            .run(&device_args(udid, &["install", "-r", &apk]), INSTALL_TIMEOUT)
            .await?;
        self.shell(udid, &["appops", "set", pkg, "PROJECT_MEDIA", "allow"])
            .await?;
        let activity = format!("{pkg}/.MainActivity");
        self.shell(udid, &["am", "start", "-n", &activity]).await?;
        ctx.pause(Duration::from_secs(1)).await?;
        self.shell(udid, &["input", "keyevent", "KEYCODE_HOME"]).await?;
        Ok(())
    }

    async fn apply_stream_settings(&self, ctx: &DeviceContext) -> Result<(), SetupError> {
        let stream = ctx.slot.stream;
        let action = format!("{}.STREAM_SETTINGS", self.stream_package);
        let fps = stream.fps.to_string();
        let quality = stream.jpeg_quality.to_string();
        let scaling = stream.scaling_factor.to_string();
        self.shell(
            ctx.udid(),
            &[
                "am", "broadcast", "-a", &action, "--ei", "fps", &fps, "--ei", "quality", &quality,
                "--ei", "scalingFactor", &scaling,
            ],
        )
        .await?;
        Ok(())
    }
}

fn device_args<'a>(udid: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut full = Vec::with_capacity(args.len() + 2);
    full.push("-s");
    full.push(udid);
    full.extend_from_slice(args);
    full
}

#[async_trait]
impl PlatformBackend for AndroidBackend {
    fn os(&self) -> DeviceOs {
        DeviceOs::Android
    }

    async fn enumerate(&self) -> Result<HashSet<String>, SetupError> {
        let out = self.adb.run(&["devices"], CMD_TIMEOUT).await?;
        Ok(parse_adb_devices(&out))
    }

    async fn prepare(&self, ctx: &DeviceContext) -> Result<(), SetupError> {
        let udid = ctx.udid().to_string();

        let brand = self.getprop(&udid, "ro.product.brand").await?;
        let model = self.getprop(&udid, "ro.product.model").await?;
        let version = self.getprop(&udid, "ro.build.version.release").await?;
        ctx.update(|rt| {
            rt.record.hardware_model = format!("{brand} {model}").trim().to_string();
            rt.record.os_version = version.clone();
            rt.record.model = model.clone();
            if rt.record.name.is_empty() {
                rt.record.name = model.clone();
            }
        });

        let record = ctx.slot.record();
        if record.screen_width.is_none() || record.screen_height.is_none() {
            let out = self.shell(&udid, &["wm", "size"]).await?;
            let (width, height) = parse_wm_size(&out).ok_or_else(|| SetupError::Parse(out.clone()))?;
            ctx.update(|rt| {
                rt.record.screen_width = Some(width);
                rt.record.screen_height = Some(height);
            });
        }

        let stream_port = ctx.allocate_port(|p, port| p.stream = Some(port)).await?;
        let appium_port = ctx.allocate_port(|p, port| p.appium = Some(port)).await?;

        self.reinstall_stream_agent(ctx).await?;

        let host_side = format!("tcp:{stream_port}");
        let device_side = format!("tcp:{STREAM_AGENT_PORT}");
        self.on_device(&udid, &["forward", &host_side, &device_side]).await?;

        for helper in AUTOMATION_HELPERS {
            if let Err(err) = self.on_device(&udid, &["uninstall", helper]).await {
                debug!(udid = %udid, helper, error = %err, "helper not removed");
            }
        }

        self.apply_stream_settings(ctx).await?;

        let third_party = self.shell(&udid, &["pm", "list", "packages", "-3"]).await?;
        ctx.update(|rt| rt.record.installed_apps = parse_packages(&third_party));

        let record = ctx.slot.record();
        let target = AppiumTarget {
            udid: &udid,
            os: DeviceOs::Android,
            os_version: &record.os_version,
            name: &record.name,
            port: appium_port,
            wda_port: None,
            wda_stream_port: None,
        };
        start_automation(ctx, &self.appium, &target).await?;
        if let Some(grid) = &self.grid {
            start_grid_node(ctx, grid, &target).await?;
        }
        Ok(())
    }

    async fn teardown(&self, slot: &DeviceSlot, ports: DevicePorts) {
        if let Some(stream) = ports.stream {
            let host_side = format!("tcp:{stream}");
            if let Err(err) = self.on_device(slot.udid(), &["forward", "--remove", &host_side]).await {
                debug!(udid = %slot.udid(), error = %err, "forward removal failed");
            }
        }
    }

    async fn perform(&self, slot: &DeviceSlot, action: DeviceAction) -> Result<ActionOutput, ActionError> {
        let udid = slot.udid();
        match action {
            DeviceAction::Home => {
                self.shell(udid, &["input", "keyevent", "KEYCODE_HOME"]).await?;
            }
            DeviceAction::Lock => {
                self.shell(udid, &["input", "keyevent", "KEYCODE_SLEEP"]).await?;
            }
            DeviceAction::Unlock => {
                self.shell(udid, &["input", "keyevent", "KEYCODE_WAKEUP"]).await?;
                self.shell(udid, &["wm", "dismiss-keyguard"]).await?;
            }
            DeviceAction::Tap { x, y } => {
                let (x, y) = (x.to_string(), y.to_string());
                self.shell(udid, &["input", "tap", &x, &y]).await?;
            }
            DeviceAction::Swipe {
                x,
                y,
                end_x,
                end_y,
                duration_ms,
            } => {
                let args = [x, y, end_x, end_y].map(|v| v.to_string());
                let duration = duration_ms.to_string();
                self.shell(
                    udid,
                    &["input", "swipe", &args[0], &args[1], &args[2], &args[3], &duration],
                )
                .await?;
            }
            DeviceAction::TouchAndHold { x, y, duration_ms } => {
                let (x, y) = (x.to_string(), y.to_string());
                let duration = duration_ms.to_string();
                self.shell(udid, &["input", "swipe", &x, &y, &x, &y, &duration])
                    .await?;
            }
            DeviceAction::TypeText(text) => {
                for chunk in adb_input_text(&text)? {
                    self.shell(udid, &["input", "text", &chunk]).await?;
                }
            }
            DeviceAction::Clear => {
                self.shell(udid, &["input", "keyevent", "KEYCODE_MOVE_END"]).await?;
                let mut args = vec!["input", "keyevent"];
                args.extend(std::iter::repeat("KEYCODE_DEL").take(100));
                self.shell(udid, &args).await?;
            }
            DeviceAction::Screenshot => {
                let png = self
                    .adb
                    .run_raw(&device_args(udid, &["exec-out", "screencap", "-p"]), CMD_TIMEOUT)
                    .await?;
                return Ok(ActionOutput::Text(
                    base64::engine::general_purpose::STANDARD.encode(png),
                ));
            }
            DeviceAction::Source => {
                self.shell(udid, &["uiautomator", "dump", DUMP_PATH]).await?;
                let xml = self.shell(udid, &["cat", DUMP_PATH]).await?;
                return Ok(ActionOutput::Text(xml));
            }
            DeviceAction::GetClipboard => {
                let out = self
                    .shell(udid, &["am", "broadcast", "-a", "io.appium.settings.clipboard.get"])
                    .await?;
                let text = match parse_broadcast(&out) {
                    BroadcastReply::Data(encoded) => {
                        let raw = base64::engine::general_purpose::STANDARD
                            .decode(encoded.trim())
                            .map_err(|err| ActionError::Parse(err.to_string()))?;
                        String::from_utf8_lossy(&raw).into_owned()
                    }
                    BroadcastReply::Empty => String::new(),
                    BroadcastReply::Unhandled => {
                        return Err(ActionError::Unavailable(format!(
                            "clipboard helper {SETTINGS_PACKAGE} is not installed on {udid}; \
                             it comes back with the next automation session"
                        )))
                    }
                };
                return Ok(ActionOutput::Text(text));
            }
        }
        Ok(ActionOutput::Done)
    }
}

/// Serials in `device` state from `adb devices`, emulators excluded.
pub fn parse_adb_devices(out: &str) -> HashSet<String> {
    out.lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let serial = cols.next()?;
            let state = cols.next()?;
            (state == "device" && !serial.starts_with("emulator")).then(|| serial.to_string())
        })
        .collect()
}

/// `Physical size: 1080x2400`, preferring an override when present.
pub fn parse_wm_size(out: &str) -> Option<(u32, u32)> {
    let pick = |prefix: &str| -> Option<(u32, u32)> {
        out.lines()
            .find_map(|line| line.trim().strip_prefix(prefix))
            .and_then(|dims| {
                let (w, h) = dims.trim().split_once('x')?;
                Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
            })
    };
    pick("Override size:").or_else(|| pick("Physical size:"))
}

pub fn parse_packages(out: &str) -> Vec<String> {
    let mut packages: Vec<String> = out
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::to_string)
        .collect();
    packages.sort();
    packages
}

/// Outcome of an `am broadcast` call.
#[derive(Debug, PartialEq, Eq)]
pub enum BroadcastReply<'a> {
    /// The `data="..."` payload.
    Data(&'a str),
    /// A receiver answered without data.
    Empty,
    /// `result=0`: no receiver handled the intent.
    Unhandled,
}

pub fn parse_broadcast(out: &str) -> BroadcastReply<'_> {
    if let Some(start) = out.find("data=\"").map(|i| i + "data=\"".len()) {
        if let Some(end) = out[start..].rfind('"') {
            return BroadcastReply::Data(&out[start..start + end]);
        }
    }
    let code = out.find("result=").and_then(|i| {
        out[i + "result=".len()..]
            .split(|c: char| c == ',' || c.is_whitespace())
            .next()
            .and_then(|raw| raw.parse::<i32>().ok())
    });
    match code {
        Some(0) => BroadcastReply::Unhandled,
        _ => BroadcastReply::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn adb_devices_keeps_ready_hardware_only() {
        let out = "* daemon started successfully\nList of devices attached\nR58M123\tdevice\nemulator-5554\tdevice\nZY22\tunauthorized\n0A1B\toffline\n9XYZ\tdevice usb:1-1 product:x\n";
        let devices = parse_adb_devices(out);
        assert_eq!(devices.len(), 2);
        assert!(devices.contains("R58M123"));
        assert!(devices.contains("9XYZ"));
    }

    #[test_timeout::timeout]
    fn wm_size_prefers_override() {
        assert_eq!(parse_wm_size("Physical size: 1080x2400"), Some((1080, 2400)));
        assert_eq!(
            parse_wm_size("Physical size: 1440x3200\nOverride size: 1080x2400"),
            Some((1080, 2400))
        );
        assert_eq!(parse_wm_size("garbage"), None);
    }

    #[test_timeout::timeout]
    fn packages_and_broadcast_payloads() {
        assert_eq!(
            parse_packages("package:com.b\npackage:com.a\n"),
            vec!["com.a".to_string(), "com.b".to_string()]
        );
        let out = "Broadcasting: Intent { act=io.appium.settings.clipboard.get }\nBroadcast completed: result=-1, data=\"aGVsbG8=\"";
        assert_eq!(parse_broadcast(out), BroadcastReply::Data("aGVsbG8="));
        assert_eq!(
            parse_broadcast("Broadcast completed: result=-1"),
            BroadcastReply::Empty
        );
    }

    #[test_timeout::timeout]
    fn unanswered_clipboard_broadcast_means_helper_missing() {
        assert_eq!(
            parse_broadcast("Broadcasting: Intent { act=io.appium.settings.clipboard.get }\nBroadcast completed: result=0"),
            BroadcastReply::Unhandled
        );
    }

    #[test_timeout::timeout]
    fn device_args_prefix_serial() {
        assert_eq!(device_args("A1", &["shell", "ls"]), vec!["-s", "A1", "shell", "ls"]);
    }
}
