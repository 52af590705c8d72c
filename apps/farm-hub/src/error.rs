use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use farm_proto::ErrorEnvelope;
use tracing::debug;

/// Failures surfaced to WebDriver clients as W3C error envelopes.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("no active session with id {0}")]
    SessionNotFound(String),
    #[error("no device with udid {0}")]
    DeviceNotFound(String),
    #[error("no matching device became available: {0}")]
    NotReady(String),
    #[error("{0}")]
    Pinned(String),
    #[error("provider rejected session creation: {0}")]
    Upstream(String),
    #[error("provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("device stream unavailable: {0}")]
    Stream(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
}

impl GridError {
    /// W3C error code for the envelope's `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            GridError::SessionNotFound(_) => "invalid session id",
            GridError::NotReady(_) | GridError::Pinned(_) => "session not created",
            GridError::InvalidArgument(_) => "invalid argument",
            GridError::UnknownCommand(_) => "unknown command",
            GridError::DeviceNotFound(_)
            | GridError::Upstream(_)
            | GridError::Transport(_)
            | GridError::Stream(_)
            | GridError::Unauthorized(_)
            | GridError::Conflict(_) => "unknown error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GridError::SessionNotFound(_)
            | GridError::DeviceNotFound(_)
            | GridError::UnknownCommand(_) => StatusCode::NOT_FOUND,
            GridError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GridError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GridError::Conflict(_) => StatusCode::CONFLICT,
            GridError::NotReady(_)
            | GridError::Pinned(_)
            | GridError::Upstream(_)
            | GridError::Transport(_)
            | GridError::Stream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code(), self.to_string(), format!("{self:?}"))
    }
}

impl IntoResponse for GridError {
    fn into_response(self) -> Response {
        debug!(code = self.code(), error = %self, "grid request failed");
        (self.status(), Json(self.envelope())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body;

    #[test_timeout::tokio_timeout_test]
    async fn unknown_session_renders_404_envelope() {
        let response = GridError::SessionNotFound("S-9".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["value"]["error"], "invalid session id");
        assert_eq!(payload["value"]["message"], "no active session with id S-9");
        assert!(payload["value"]["stacktrace"]
            .as_str()
            .unwrap()
            .contains("SessionNotFound"));
    }

    #[test_timeout::timeout]
    fn selection_failures_map_to_session_not_created() {
        for err in [
            GridError::NotReady("no android device".into()),
            GridError::Pinned("device X is busy".into()),
        ] {
            assert_eq!(err.code(), "session not created");
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(
            GridError::InvalidArgument("bad body".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GridError::DeviceNotFound("Z".into()).status(),
            StatusCode::NOT_FOUND
        );
    }
}
