//! `NEW SESSION` handling: pick a device, reserve it, create the session on
//! its provider and pin the returned id.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Response;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::capabilities::SessionRequest;
use crate::error::GridError;
use crate::proxy;
use crate::registry::{Registry, Reservation};
use crate::selection::Rejection;
use crate::state::AppState;

/// Reverts its reservation on drop unless the session was committed. Dropping the
/// request future on client disconnect therefore releases the device too.
struct ReservationGuard {
    registry: Arc<Registry>,
    udid: String,
    committed: bool,
}

impl ReservationGuard {
    fn new(registry: Arc<Registry>, udid: String) -> Self {
        Self {
            registry,
            udid,
            committed: false,
        }
    }

    fn commit(mut self, session_id: &str) {
        self.registry
            .pin_session(&self.udid, session_id, farm_proto::now_millis());
        self.committed = true;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.revert_reservation(&self.udid);
        }
    }
}

pub async fn create_session(
    state: AppState,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GridError> {
    let request = SessionRequest::parse(&body)?;
    let reservation = wait_for_device(&state, &request).await?;
    let guard = ReservationGuard::new(state.registry.clone(), reservation.udid.clone());

    let url = proxy::with_query(
        format!(
            "{}/device/{}/appium{}",
            reservation.base_url,
            reservation.udid,
            proxy::upstream_path(uri.path())
        ),
        uri.query(),
    );
    info!(udid = %reservation.udid, url = %url, "creating session on provider");

    let upstream = state
        .http
        .post(&url)
        .headers(proxy::request_headers(&headers))
        .body(body)
        .send()
        .await?;
    let status = upstream.status();
    let upstream_headers = proxy::response_headers(upstream.headers());
    let payload = upstream.bytes().await?;

    if !status.is_success() {
        warn!(udid = %reservation.udid, status = %status, "provider refused session");
        return Err(GridError::Upstream(describe_failure(status, &payload)));
    }
    let session_id = extract_session_id(&payload).ok_or_else(|| {
        GridError::Upstream("provider response carried no session id".into())
    })?;

    guard.commit(&session_id);
    info!(udid = %reservation.udid, session_id = %session_id, "session pinned");

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    *response.headers_mut() = upstream_headers;
    Ok(response)
}

async fn wait_for_device(
    state: &AppState,
    request: &SessionRequest,
) -> Result<Reservation, GridError> {
    let deadline = Instant::now() + request.selection_wait(state.grid.selection_wait);
    loop {
        match state
            .registry
            .reserve(request, state.window(), state.grid.default_idle_timeout_ms)
        {
            Ok(reservation) => return Ok(reservation),
            Err(Rejection::Pinned(message)) => return Err(GridError::Pinned(message)),
            Err(Rejection::Unavailable(message)) => {
                if Instant::now() >= deadline {
                    return Err(GridError::NotReady(message));
                }
            }
        }
        sleep(state.grid.selection_poll).await;
    }
}

/// W3C puts the id under `value.sessionId`; legacy JSONWP at the top level.
fn extract_session_id(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .pointer("/value/sessionId")
        .or_else(|| value.get("sessionId"))
        .and_then(Value::as_str)
        .filter(|sid| !sid.is_empty())
        .map(str::to_string)
}

fn describe_failure(status: StatusCode, payload: &[u8]) -> String {
    let detail = serde_json::from_slice::<Value>(payload).ok().and_then(|v| {
        v.pointer("/value/message")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match detail {
        Some(message) => format!("status {status}: {message}"),
        None => format!("status {status}"),
    }
}
