use serde::{Deserialize, Serialize};

/// W3C WebDriver error body: `{"value":{"error":..,"message":..,"stacktrace":..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub value: ErrorValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub stacktrace: String,
}

impl ErrorEnvelope {
    pub fn new(
        error: impl Into<String>,
        message: impl Into<String>,
        stacktrace: impl Into<String>,
    ) -> Self {
        Self {
            value: ErrorValue {
                error: error.into(),
                message: message.into(),
                stacktrace: stacktrace.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn serializes_w3c_shape() {
        let envelope = ErrorEnvelope::new("invalid session id", "no session S-1", "");
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(encoded["value"]["error"], "invalid session id");
        assert_eq!(encoded["value"]["message"], "no session S-1");
        assert_eq!(encoded["value"]["stacktrace"], "");
    }
}
