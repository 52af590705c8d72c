//! Per-device HTTP surface consumed by the hub and UI clients.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use farm_proto::{Device, DeviceOs};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::actions::{ActionError, ActionOutput, DeviceAction};
use crate::device::{DevicePorts, DeviceSlot};
use crate::probes;
use crate::stream::{self, Framing, StreamSource};
use crate::supervisor::Supervisor;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_PROXY_BODY: usize = 256 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub mjpeg_max_frame: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/device/:udid/health", get(device_health))
        .route("/device/:udid/android-stream", get(android_stream))
        .route("/device/:udid/ios-stream", get(ios_stream))
        .route("/device/:udid/android-stream-mjpeg", get(android_stream_mjpeg))
        .route("/device/:udid/ios-stream-mjpeg", get(ios_stream_mjpeg))
        .route("/device/:udid/appium/*path", any(appium_proxy))
        .route("/device/:udid/:action", post(device_action))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(state.supervisor.snapshot())
}

fn slot_for(state: &AppState, udid: &str) -> Result<Arc<DeviceSlot>, ActionError> {
    state
        .supervisor
        .slot(udid)
        .ok_or_else(|| ActionError::UnknownDevice(udid.to_string()))
}

fn live_slot(state: &AppState, udid: &str) -> Result<Arc<DeviceSlot>, ActionError> {
    let slot = slot_for(state, udid)?;
    if !slot.is_live() {
        return Err(ActionError::NotLive(udid.to_string()));
    }
    Ok(slot)
}

/// `200` iff the automation server answers its status endpoint in time.
async fn device_health(State(state): State<AppState>, Path(udid): Path<String>) -> StatusCode {
    let Ok(slot) = slot_for(&state, &udid) else {
        return StatusCode::NOT_FOUND;
    };
    let Some(port) = slot.ports().appium else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let url = format!("http://localhost:{port}/status");
    if probes::check(state.supervisor.http(), &url, HEALTH_TIMEOUT).await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn device_action(
    State(state): State<AppState>,
    Path((udid, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<ActionOutput, ActionError> {
    let action = DeviceAction::parse(&action, &body)?;
    let slot = live_slot(&state, &udid)?;
    let backend = state
        .supervisor
        .backend(slot.os())
        .ok_or_else(|| ActionError::UnknownDevice(udid.clone()))?;
    debug!(udid = %udid, ?action, "device action");
    backend.perform(&slot, action).await
}

/// Verbatim pass-through to the device's automation server.
async fn appium_proxy(
    State(state): State<AppState>,
    Path((udid, path)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ActionError> {
    let slot = slot_for(&state, &udid)?;
    let port = slot
        .ports()
        .appium
        .ok_or_else(|| ActionError::NotLive(udid.clone()))?;

    let (parts, body) = req.into_parts();
    let body = to_bytes(body, MAX_PROXY_BODY)
        .await
        .map_err(|err| ActionError::InvalidBody(err.to_string()))?;
    let mut url = format!("http://localhost:{port}/{}", path.trim_start_matches('/'));
    if let Some(query) = parts.uri.query().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let upstream = state
        .supervisor
        .http()
        .request(parts.method, &url)
        .headers(forwardable(&parts.headers))
        .body(body)
        .send()
        .await?;
    let status = upstream.status();
    let mut headers = forwardable(upstream.headers());
    headers.remove(header::ACCESS_CONTROL_ALLOW_ORIGIN);
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn forwardable(source: &HeaderMap) -> HeaderMap {
    let mut headers = source.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
    headers.remove("keep-alive");
    headers
}

/// Port and scope of a live device's stream, checked against the route's platform.
fn stream_target(
    state: &AppState,
    udid: &str,
    os: DeviceOs,
    port: impl Fn(&DevicePorts) -> Option<u16>,
) -> Result<(u16, CancellationToken), ActionError> {
    let slot = live_slot(state, udid)?;
    if slot.os() != os {
        return Err(ActionError::WrongPlatform {
            udid: udid.to_string(),
            expected: os,
        });
    }
    let (ports, scope) = slot.update(|rt| (rt.ports, rt.scope.clone()));
    match (port(&ports), scope) {
        (Some(port), Some(scope)) => Ok((port, scope)),
        _ => Err(ActionError::NotLive(udid.to_string())),
    }
}

async fn android_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Response, ActionError> {
    let (port, scope) = stream_target(&state, &udid, DeviceOs::Android, |p| p.stream)?;
    let frames = stream::open(StreamSource::WebSocket { port }, Framing::Raw, scope);
    Ok(ws.on_upgrade(move |socket| stream::relay_to_socket(socket, frames)))
}

async fn ios_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Response, ActionError> {
    let (port, scope) = stream_target(&state, &udid, DeviceOs::Ios, |p| p.stream)?;
    let framing = Framing::Jpeg {
        max_frame: state.mjpeg_max_frame,
    };
    let frames = stream::open(StreamSource::Tcp { port }, framing, scope);
    Ok(ws.on_upgrade(move |socket| stream::relay_to_socket(socket, frames)))
}

async fn android_stream_mjpeg(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Response, ActionError> {
    let (port, scope) = stream_target(&state, &udid, DeviceOs::Android, |p| p.stream)?;
    let framing = Framing::Jpeg {
        max_frame: state.mjpeg_max_frame,
    };
    let frames = stream::open(StreamSource::WebSocket { port }, framing, scope);
    Ok(stream::mjpeg_response(frames))
}

async fn ios_stream_mjpeg(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Response, ActionError> {
    let (port, scope) = stream_target(&state, &udid, DeviceOs::Ios, |p| p.stream)?;
    let framing = Framing::Jpeg {
        max_frame: state.mjpeg_max_frame,
    };
    let frames = stream::open(StreamSource::Tcp { port }, framing, scope);
    Ok(stream::mjpeg_response(frames))
}
