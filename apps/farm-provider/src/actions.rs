//! Device interaction requests accepted on `POST /device/{udid}/{action}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::ToolError;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    Home,
    Lock,
    Unlock,
    Tap { x: f64, y: f64 },
    Swipe { x: f64, y: f64, end_x: f64, end_y: f64, duration_ms: u64 },
    TouchAndHold { x: f64, y: f64, duration_ms: u64 },
    TypeText(String),
    Clear,
    Screenshot,
    Source,
    GetClipboard,
}

#[derive(Deserialize)]
struct Point {
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwipeBody {
    x: f64,
    y: f64,
    end_x: f64,
    end_y: f64,
    #[serde(default = "default_swipe_ms")]
    duration: u64,
}

#[derive(Deserialize)]
struct HoldBody {
    x: f64,
    y: f64,
    #[serde(default = "default_hold_ms")]
    duration: u64,
}

#[derive(Deserialize)]
struct TextBody {
    text: String,
}

fn default_swipe_ms() -> u64 {
    500
}

fn default_hold_ms() -> u64 {
    2000
}

impl DeviceAction {
    pub fn parse(name: &str, body: &[u8]) -> Result<Self, ActionError> {
        fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ActionError> {
            serde_json::from_slice(body).map_err(|err| ActionError::InvalidBody(err.to_string()))
        }
        Ok(match name {
            "home" => Self::Home,
            "lock" => Self::Lock,
            "unlock" => Self::Unlock,
            "tap" => {
                let p: Point = decode(body)?;
                Self::Tap { x: p.x, y: p.y }
            }
            "swipe" => {
                let s: SwipeBody = decode(body)?;
                Self::Swipe {
                    x: s.x,
                    y: s.y,
                    end_x: s.end_x,
                    end_y: s.end_y,
                    duration_ms: s.duration,
                }
            }
            "touchAndHold" => {
                let h: HoldBody = decode(body)?;
                Self::TouchAndHold {
                    x: h.x,
                    y: h.y,
                    duration_ms: h.duration,
                }
            }
            "typeText" => Self::TypeText(decode::<TextBody>(body)?.text),
            "clear" => Self::Clear,
            "screenshot" => Self::Screenshot,
            "source" => Self::Source,
            "getClipboard" => Self::GetClipboard,
            other => return Err(ActionError::UnknownAction(other.to_string())),
        })
    }
}

/// Result of an action; rendered as `{"value": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutput {
    Done,
    Text(String),
}

impl IntoResponse for ActionOutput {
    fn into_response(self) -> Response {
        let value = match self {
            ActionOutput::Done => Value::Null,
            ActionOutput::Text(text) => Value::String(text),
        };
        Json(json!({ "value": value })).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("unknown action {0}")]
    UnknownAction(String),
    #[error("invalid body: {0}")]
    InvalidBody(String),
    #[error("device {0} is not live")]
    NotLive(String),
    #[error("device {udid} has no {expected} stream")]
    WrongPlatform { udid: String, expected: farm_proto::DeviceOs },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent answered {status}: {body}")]
    Agent { status: u16, body: String },
    #[error("unexpected agent output: {0}")]
    Parse(String),
    #[error("{0}")]
    Unavailable(String),
}

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ActionError::UnknownDevice(_) | ActionError::UnknownAction(_) => StatusCode::NOT_FOUND,
            ActionError::InvalidBody(_) | ActionError::WrongPlatform { .. } => StatusCode::BAD_REQUEST,
            ActionError::NotLive(_) => StatusCode::CONFLICT,
            ActionError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// W3C pointer sequence for a single touch input.
pub fn pointer_actions(steps: Vec<Value>) -> Value {
    json!({
        "actions": [{
            "type": "pointer",
            "id": "finger1",
            "parameters": { "pointerType": "touch" },
            "actions": steps,
        }]
    })
}

fn move_to(x: f64, y: f64, duration_ms: u64) -> Value {
    json!({ "type": "pointerMove", "duration": duration_ms, "x": x, "y": y, "origin": "viewport" })
}

fn down() -> Value {
    json!({ "type": "pointerDown", "button": 0 })
}

fn up() -> Value {
    json!({ "type": "pointerUp", "button": 0 })
}

fn pause(duration_ms: u64) -> Value {
    json!({ "type": "pause", "duration": duration_ms })
}

pub fn tap_actions(x: f64, y: f64) -> Value {
    pointer_actions(vec![move_to(x, y, 0), down(), pause(100), up()])
}

pub fn swipe_actions(x: f64, y: f64, end_x: f64, end_y: f64, duration_ms: u64) -> Value {
    pointer_actions(vec![
        move_to(x, y, 0),
        down(),
        move_to(end_x, end_y, duration_ms),
        up(),
    ])
}

pub fn hold_actions(x: f64, y: f64, duration_ms: u64) -> Value {
    pointer_actions(vec![move_to(x, y, 0), down(), pause(duration_ms), up()])
}

/// Arguments for successive `adb shell input text` calls that type `text`.
///
/// The device shell sees each argument single-quoted. `input` turns every
/// `%s` into a space, so a literal `%` followed by `s` ends its chunk.
pub fn adb_input_text(text: &str) -> Result<Vec<String>, ActionError> {
    if text.chars().any(char::is_control) {
        return Err(ActionError::InvalidBody(
            "text contains control characters; send key events instead".into(),
        ));
    }
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut current = String::new();
    for (i, &ch) in chars.iter().enumerate() {
        match ch {
            ' ' => current.push_str("%s"),
            _ => current.push(ch),
        }
        if ch == '%' && chars.get(i + 1) == Some(&'s') {
            chunks.push(shell_quote(&std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        chunks.push(shell_quote(&current));
    }
    Ok(chunks)
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Reads `value` from a W3C response body.
pub fn w3c_value(body: &Value) -> Option<&Value> {
    body.get("value")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_bodies_with_defaults() {
        assert_eq!(
            DeviceAction::parse("tap", br#"{"x": 10, "y": 20.5}"#).unwrap(),
            DeviceAction::Tap { x: 10.0, y: 20.5 }
        );
        assert_eq!(
            DeviceAction::parse("swipe", br#"{"x":1,"y":2,"endX":3,"endY":4}"#).unwrap(),
            DeviceAction::Swipe {
                x: 1.0,
                y: 2.0,
                end_x: 3.0,
                end_y: 4.0,
                duration_ms: 500
            }
        );
        assert_eq!(
            DeviceAction::parse("typeText", br#"{"text":"hi"}"#).unwrap(),
            DeviceAction::TypeText("hi".into())
        );
        assert_eq!(DeviceAction::parse("home", b"").unwrap(), DeviceAction::Home);
    }

    #[test_timeout::timeout]
    fn rejects_unknown_and_malformed() {
        assert!(matches!(
            DeviceAction::parse("shake", b""),
            Err(ActionError::UnknownAction(_))
        ));
        assert!(matches!(
            DeviceAction::parse("tap", b"{\"x\":1}"),
            Err(ActionError::InvalidBody(_))
        ));
    }

    #[test_timeout::timeout]
    fn swipe_moves_over_duration() {
        let body = swipe_actions(1.0, 2.0, 3.0, 4.0, 750);
        let steps = body["actions"][0]["actions"].as_array().unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[2]["type"], "pointerMove");
        assert_eq!(steps[2]["duration"], 750);
        assert_eq!(body["actions"][0]["parameters"]["pointerType"], "touch");

        let hold = hold_actions(5.0, 5.0, 2000);
        assert_eq!(hold["actions"][0]["actions"][2]["duration"], 2000);
    }

    #[test_timeout::timeout]
    fn adb_text_is_escaped() {
        assert_eq!(adb_input_text("a b&c").unwrap(), vec!["'a%sb&c'"]);
        assert_eq!(adb_input_text("plain").unwrap(), vec!["'plain'"]);
        assert_eq!(adb_input_text("it's").unwrap(), vec![r"'it'\''s'"]);
        assert!(adb_input_text("").unwrap().is_empty());
    }

    #[test_timeout::timeout]
    fn adb_text_keeps_braces_and_brackets_literal() {
        assert_eq!(
            adb_input_text("{a}[b] $x ~").unwrap(),
            vec!["'{a}[b]%s$x%s~'"]
        );
    }

    #[test_timeout::timeout]
    fn adb_text_splits_literal_percent_s() {
        assert_eq!(adb_input_text("50%sale").unwrap(), vec!["'50%'", "'sale'"]);
        assert_eq!(adb_input_text("100% off").unwrap(), vec!["'100%%soff'"]);
    }

    #[test_timeout::timeout]
    fn adb_text_rejects_control_characters() {
        assert!(matches!(
            adb_input_text("line\nbreak"),
            Err(ActionError::InvalidBody(_))
        ));
        assert!(matches!(adb_input_text("a\tb"), Err(ActionError::InvalidBody(_))));
    }
}
