//! Command lines for the automation server and the optional grid node.

use std::path::Path;

use farm_proto::DeviceOs;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Per-device facts that end up in the automation server's default capabilities.
#[derive(Debug, Clone)]
pub struct AppiumTarget<'a> {
    pub udid: &'a str,
    pub os: DeviceOs,
    pub os_version: &'a str,
    pub name: &'a str,
    pub port: u16,
    pub wda_port: Option<u16>,
    pub wda_stream_port: Option<u16>,
}

impl AppiumTarget<'_> {
    pub fn automation_name(&self) -> &'static str {
        match self.os {
            DeviceOs::Android => "UiAutomator2",
            DeviceOs::Ios => "XCUITest",
        }
    }

    pub fn platform_name(&self) -> &'static str {
        match self.os {
            DeviceOs::Android => "Android",
            DeviceOs::Ios => "iOS",
        }
    }

    pub fn default_capabilities(&self) -> Value {
        let mut caps = Map::new();
        caps.insert("platformName".into(), json!(self.platform_name()));
        caps.insert("appium:automationName".into(), json!(self.automation_name()));
        caps.insert("appium:udid".into(), json!(self.udid));
        if !self.name.is_empty() {
            caps.insert("appium:deviceName".into(), json!(self.name));
        }
        if !self.os_version.is_empty() {
            caps.insert("appium:platformVersion".into(), json!(self.os_version));
        }
        if let Some(wda) = self.wda_port {
            caps.insert(
                "appium:webDriverAgentUrl".into(),
                json!(format!("http://localhost:{wda}")),
            );
        }
        if let Some(mjpeg) = self.wda_stream_port {
            caps.insert("appium:mjpegServerPort".into(), json!(mjpeg));
        }
        Value::Object(caps)
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-p".into(),
            self.port.to_string(),
            "--log-timestamp".into(),
            "--log-no-colors".into(),
            "--session-override".into(),
            "--default-capabilities".into(),
            self.default_capabilities().to_string(),
        ]
    }
}

#[derive(Debug, Serialize)]
struct NodeConfig {
    server: NodeServer,
    node: NodeSection,
    relay: RelaySection,
}

#[derive(Debug, Serialize)]
struct NodeServer {
    port: u16,
}

#[derive(Debug, Serialize)]
struct NodeSection {
    #[serde(rename = "detect-drivers")]
    detect_drivers: bool,
    #[serde(rename = "max-sessions")]
    max_sessions: u32,
}

#[derive(Debug, Serialize)]
struct RelaySection {
    url: String,
    #[serde(rename = "status-endpoint")]
    status_endpoint: String,
    configs: Vec<String>,
}

/// Relay configuration registering one device's automation server with a grid.
pub fn grid_node_toml(target: &AppiumTarget<'_>, node_port: u16) -> Result<String, toml::ser::Error> {
    let stereotype = json!({
        "platformName": target.platform_name(),
        "appium:automationName": target.automation_name(),
        "appium:platformVersion": target.os_version,
        "appium:udid": target.udid,
    });
    toml::to_string(&NodeConfig {
        server: NodeServer { port: node_port },
        node: NodeSection {
            detect_drivers: false,
            max_sessions: 1,
        },
        relay: RelaySection {
            url: format!("http://localhost:{}", target.port),
            status_endpoint: "/status".into(),
            configs: vec!["1".into(), stereotype.to_string()],
        },
    })
}

pub fn grid_node_args(jar: &Path, config: &Path, grid_url: &str) -> Vec<String> {
    vec![
        "-jar".into(),
        jar.display().to_string(),
        "node".into(),
        "--config".into(),
        config.display().to_string(),
        "--hub".into(),
        grid_url.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ios() -> AppiumTarget<'static> {
        AppiumTarget {
            udid: "I1",
            os: DeviceOs::Ios,
            os_version: "17.4",
            name: "iPhone",
            port: 4723,
            wda_port: Some(8100),
            wda_stream_port: Some(9100),
        }
    }

    #[test_timeout::timeout]
    fn ios_capabilities_point_at_forwarded_wda() {
        let caps = ios().default_capabilities();
        assert_eq!(caps["appium:automationName"], "XCUITest");
        assert_eq!(caps["appium:webDriverAgentUrl"], "http://localhost:8100");
        assert_eq!(caps["appium:mjpegServerPort"], 9100);

        let args = ios().args();
        assert_eq!(&args[..2], ["-p", "4723"]);
        let caps_arg: Value = serde_json::from_str(args.last().unwrap()).unwrap();
        assert_eq!(caps_arg["appium:udid"], "I1");
    }

    #[test_timeout::timeout]
    fn android_capabilities_skip_wda() {
        let target = AppiumTarget {
            udid: "A1",
            os: DeviceOs::Android,
            os_version: "",
            name: "",
            port: 4800,
            wda_port: None,
            wda_stream_port: None,
        };
        let caps = target.default_capabilities();
        assert_eq!(caps["platformName"], "Android");
        assert!(caps.get("appium:webDriverAgentUrl").is_none());
        assert!(caps.get("appium:platformVersion").is_none());
    }

    #[test_timeout::timeout]
    fn grid_node_relays_to_local_server() {
        let raw = grid_node_toml(&ios(), 5555).unwrap();
        let parsed: toml::Value = toml::from_str(&raw).unwrap();
        assert_eq!(parsed["server"]["port"].as_integer(), Some(5555));
        assert_eq!(parsed["relay"]["url"].as_str(), Some("http://localhost:4723"));
        let configs = parsed["relay"]["configs"].as_array().unwrap();
        assert_eq!(configs[0].as_str(), Some("1"));
        assert!(configs[1].as_str().unwrap().contains("\"appium:udid\":\"I1\""));

        let args = grid_node_args(Path::new("grid.jar"), Path::new("node.toml"), "http://grid:4444");
        assert_eq!(args[2], "node");
        assert_eq!(args.last().map(String::as_str), Some("http://grid:4444"));
    }
}
