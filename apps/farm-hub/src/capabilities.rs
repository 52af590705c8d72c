//! Reads the handful of capabilities the dispatcher routes on.
//!
//! Each key is looked up through `capabilities.firstMatch[0]`, then
//! `capabilities.alwaysMatch`, then `desiredCapabilities`, with or without the
//! `appium:` vendor prefix.

use std::time::Duration;

use farm_proto::DeviceOs;
use serde_json::{Map, Value};

use crate::error::GridError;

/// Upper bound on a client-requested selection wait.
pub const MAX_SELECTION_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRequest {
    pub platform: Option<DeviceOs>,
    pub automation: Option<DeviceOs>,
    pub udid: Option<String>,
    pub platform_version: Option<String>,
    pub new_command_timeout_secs: Option<f64>,
    pub session_timeout_secs: Option<f64>,
}

impl SessionRequest {
    pub fn parse(body: &[u8]) -> Result<Self, GridError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| GridError::InvalidArgument(format!("malformed session body: {err}")))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, GridError> {
        let root = value.as_object().ok_or_else(|| {
            GridError::InvalidArgument("session body must be a JSON object".into())
        })?;
        let layers = capability_layers(root);

        let platform = match lookup_str(&layers, "platformName") {
            Some(name) => Some(DeviceOs::from_platform_name(&name).ok_or_else(|| {
                GridError::InvalidArgument(format!("unsupported platformName {name}"))
            })?),
            None => None,
        };
        let automation = match lookup_str(&layers, "automationName") {
            Some(name) => DeviceOs::from_automation_name(&name),
            None => None,
        };

        Ok(Self {
            platform,
            automation,
            udid: lookup_str(&layers, "udid").filter(|u| !u.is_empty()),
            platform_version: lookup_str(&layers, "platformVersion").filter(|v| !v.is_empty()),
            new_command_timeout_secs: lookup_number(&layers, "newCommandTimeout"),
            session_timeout_secs: lookup_number(&layers, "sessionTimeout"),
        })
    }

    /// Platform to filter on; the automation name stands in when the platform is absent.
    pub fn target_os(&self) -> Option<DeviceOs> {
        self.platform.or(self.automation)
    }

    /// Idle timeout in ms for the lease, `default_ms` when absent or non-positive.
    pub fn idle_timeout_ms(&self, default_ms: i64) -> i64 {
        match self.new_command_timeout_secs {
            Some(secs) if secs > 0.0 => (secs * 1000.0).round() as i64,
            _ => default_ms,
        }
    }

    /// Client wait from `sessionTimeout`, capped at [`MAX_SELECTION_WAIT`].
    pub fn selection_wait(&self, default: Duration) -> Duration {
        match self.session_timeout_secs {
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
                .unwrap_or(MAX_SELECTION_WAIT)
                .min(MAX_SELECTION_WAIT),
            _ => default,
        }
    }
}

fn capability_layers(root: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let mut layers = Vec::with_capacity(3);
    if let Some(caps) = root.get("capabilities").and_then(Value::as_object) {
        if let Some(first) = caps
            .get("firstMatch")
            .and_then(Value::as_array)
            .and_then(|matches| matches.first())
            .and_then(Value::as_object)
        {
            layers.push(first);
        }
        if let Some(always) = caps.get("alwaysMatch").and_then(Value::as_object) {
            layers.push(always);
        }
    }
    if let Some(desired) = root.get("desiredCapabilities").and_then(Value::as_object) {
        layers.push(desired);
    }
    layers
}

fn lookup<'a>(layers: &[&'a Map<String, Value>], key: &str) -> Option<&'a Value> {
    let prefixed = format!("appium:{key}");
    layers.iter().find_map(|layer| {
        layer
            .get(&prefixed)
            .or_else(|| layer.get(key))
            .filter(|v| !v.is_null())
    })
}

fn lookup_str(layers: &[&Map<String, Value>], key: &str) -> Option<String> {
    match lookup(layers, key)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lookup_number(layers: &[&Map<String, Value>], key: &str) -> Option<f64> {
    match lookup(layers, key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
