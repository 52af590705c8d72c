//! Inventory endpoints: heartbeat ingest, listings, human control leases and
//! the pass-through to a provider's per-device surface.

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use farm_proto::{ProviderData, ProviderUpdate};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::GridError;
use crate::proxy;
use crate::registry::{ControlError, HubDevice};
use crate::state::AppState;
use crate::streams;

const MAX_DEVICE_BODY: usize = 64 * 1024 * 1024;

pub async fn provider_update(
    State(state): State<AppState>,
    Json(update): Json<ProviderUpdate>,
) -> StatusCode {
    debug!(
        provider = %update.provider.nickname,
        devices = update.device_data.len(),
        "heartbeat received"
    );
    if let Err(err) = state.store.upsert_provider(&update.provider).await {
        warn!(provider = %update.provider.nickname, error = %err, "provider record not persisted");
    }
    state.registry.apply_update(update);
    StatusCode::OK
}

pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<HubDevice>> {
    Json(state.registry.snapshot())
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderData>> {
    Json(state.registry.providers())
}

#[derive(Debug, Deserialize)]
pub struct ControlClaim {
    pub user: String,
}

pub async fn claim_control(
    State(state): State<AppState>,
    Path(udid): Path<String>,
    Json(claim): Json<ControlClaim>,
) -> Result<StatusCode, GridError> {
    let user = claim.user.trim();
    if user.is_empty() {
        return Err(GridError::InvalidArgument("user must not be empty".into()));
    }
    state
        .registry
        .claim_control(&udid, user, farm_proto::now_millis())
        .map_err(|err| control_error(&udid, err))?;
    debug!(udid = %udid, user = %user, "control lease refreshed");
    Ok(StatusCode::OK)
}

pub async fn release_control(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<StatusCode, GridError> {
    state
        .registry
        .release_control(&udid)
        .map_err(|err| control_error(&udid, err))?;
    info!(udid = %udid, "control lease released");
    Ok(StatusCode::OK)
}

fn control_error(udid: &str, err: ControlError) -> GridError {
    match err {
        ControlError::UnknownDevice => GridError::DeviceNotFound(udid.to_string()),
        ControlError::RunningAutomation => {
            GridError::Conflict(format!("device {udid} is running automation"))
        }
        ControlError::HeldBy(user) => {
            GridError::Conflict(format!("device {udid} is controlled by {user}"))
        }
    }
}

/// Forwards `/device/{udid}/…` to the owning provider, streaming the response.
/// WebSocket upgrades (the live screen streams) are relayed frame by frame.
pub async fn forward_device(
    State(state): State<AppState>,
    Path((udid, rest)): Path<(String, String)>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Result<Response, GridError> {
    let handle = state
        .registry
        .get(&udid)
        .ok_or_else(|| GridError::DeviceNotFound(udid.clone()))?;

    let (parts, body) = req.into_parts();
    let url = proxy::with_query(
        format!(
            "{}/device/{}/{}",
            handle.device.provider_base_url(),
            udid,
            rest.trim_start_matches('/')
        ),
        parts.uri.query(),
    );

    if let Some(ws) = ws {
        let url = streams::websocket_url(&url);
        let upstream = streams::connect(&url).await?;
        debug!(udid = %udid, url = %url, "relaying device stream");
        return Ok(ws.on_upgrade(move |socket| streams::pump(socket, upstream)));
    }

    let body = axum::body::to_bytes(body, MAX_DEVICE_BODY)
        .await
        .map_err(|err| GridError::InvalidArgument(format!("unreadable request body: {err}")))?;
    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(proxy::request_headers(&parts.headers))
        .body(body)
        .send()
        .await?;
    let status = upstream.status();
    let headers = proxy::response_headers(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
