use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{self, Body};
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use farm_hub::auth::AuthKeys;
use farm_hub::config::GridSettings;
use farm_hub::registry::Registry;
use farm_hub::routes::build_router;
use farm_hub::state::AppState;
use farm_store::{DeviceStore, MemoryStore};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tower::util::ServiceExt;

async fn fake_create(
    State(counter): State<Arc<AtomicUsize>>,
    Path(udid): Path<String>,
) -> axum::response::Response {
    if udid == "BAD" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"value": {"error": "session not created", "message": "app missing"}})),
        )
            .into_response();
    }
    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(json!({"value": {"sessionId": format!("S-{udid}-{n}"), "capabilities": {}}})),
    )
        .into_response()
}

async fn fake_command(Path((udid, sid, rest)): Path<(String, String, String)>) -> Json<Value> {
    Json(json!({"value": {"udid": udid, "sid": sid, "path": rest}}))
}

async fn fake_delete(Path((_udid, _sid)): Path<(String, String)>) -> Json<Value> {
    Json(json!({"value": null}))
}

async fn spawn_provider() -> SocketAddr {
    let app = Router::new()
        .route("/device/:udid/appium/session", post(fake_create))
        .route("/device/:udid/appium/session/:sid", delete(fake_delete))
        .route("/device/:udid/appium/session/:sid/*rest", any(fake_command))
        .with_state(Arc::new(AtomicUsize::new(0)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn settings() -> GridSettings {
    GridSettings {
        selection_wait: Duration::from_millis(300),
        ..GridSettings::default()
    }
}

fn hub(registry: Arc<Registry>, auth: Option<Arc<AuthKeys>>) -> Router {
    let state = AppState::new(registry, MemoryStore::new(), settings(), auth);
    build_router(state, None)
}

fn heartbeat(provider: SocketAddr, devices: &[(&str, &str, &str)], ts: i64) -> Value {
    let device_data: Vec<Value> = devices
        .iter()
        .map(|(udid, os, version)| {
            json!({
                "udid": udid,
                "os": os,
                "os_version": version,
                "provider": "lab-1",
                "host": provider.to_string(),
                "connected": true,
                "provider_state": "live",
                "last_updated_timestamp": ts,
            })
        })
        .collect();
    json!({
        "provider": {"nickname": "lab-1", "host_address": "127.0.0.1", "port": provider.port()},
        "device_data": device_data,
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, provider: SocketAddr, devices: &[(&str, &str, &str)]) {
    let (status, _) = send(
        app,
        "POST",
        "/provider-update",
        Some(heartbeat(provider, devices, farm_proto::now_millis())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

fn android_session(extra: Value) -> Value {
    let mut caps = json!({"platformName": "Android"});
    if let (Some(caps), Some(extra)) = (caps.as_object_mut(), extra.as_object()) {
        caps.extend(extra.clone());
    }
    json!({"capabilities": {"firstMatch": [caps]}})
}

#[test_timeout::tokio_timeout_test(30)]
async fn happy_path_pins_session_and_relays_commands() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    register(&app, provider, &[("A1", "android", "13")]).await;

    let (status, body) = send(
        &app,
        "POST",
        "/grid/session",
        Some(android_session(json!({"appium:newCommandTimeout": 30}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"]["sessionId"], "S-A1-1");

    let handle = registry.get("A1").unwrap();
    assert_eq!(handle.session_id, "S-A1-1");
    assert_eq!(handle.appium_new_command_timeout, 30_000);
    assert_eq!(handle.in_use_by, "automation");
    assert!(handle.is_running_automation);
    assert!(!handle.is_available_for_automation);

    let (status, body) = send(&app, "GET", "/grid/session/S-A1-1/url", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"]["udid"], "A1");
    assert_eq!(body["value"]["path"], "url");
}

#[test_timeout::tokio_timeout_test(30)]
async fn second_session_on_single_device_is_not_ready() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    register(&app, provider, &[("A1", "android", "13")]).await;

    let (first, _) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    let (second, body) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["value"]["error"], "session not created");
}

#[test_timeout::tokio_timeout_test(30)]
async fn delete_releases_device_and_forgets_session() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    register(&app, provider, &[("D", "android", "13")]).await;

    let (_, body) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    let sid = body["value"]["sessionId"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "DELETE", &format!("/grid/session/{sid}"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "GET", &format!("/grid/session/{sid}/url"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["value"]["error"], "invalid session id");

    let (status, body) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"]["sessionId"], "S-D-2");
    assert_eq!(registry.get("D").unwrap().session_id, "S-D-2");
}

#[test_timeout::tokio_timeout_test(30)]
async fn pinned_busy_device_fails_without_waiting() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let state = AppState::new(
        registry.clone(),
        MemoryStore::new(),
        GridSettings::default(),
        None,
    );
    let app = build_router(state, None);
    register(&app, provider, &[("X", "ios", "17.2")]).await;

    let pinned = json!({"capabilities": {"firstMatch": [{"platformName": "iOS", "appium:udid": "X"}]}});
    let (status, _) = send(&app, "POST", "/grid/session", Some(pinned.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let started = Instant::now();
    let (status, body) = send(&app, "POST", "/grid/session", Some(pinned)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["value"]["error"], "session not created");
    assert_eq!(body["value"]["message"], "device X is busy");
    assert_eq!(registry.get("X").unwrap().session_id, "S-X-1");
}

#[test_timeout::tokio_timeout_test(30)]
async fn pinned_stale_device_waits_then_is_not_ready() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    let stale = heartbeat(
        provider,
        &[("X", "android", "13")],
        farm_proto::now_millis() - 4_000,
    );
    send(&app, "POST", "/provider-update", Some(stale)).await;

    let started = Instant::now();
    let (status, body) = send(
        &app,
        "POST",
        "/grid/session",
        Some(android_session(json!({"appium:udid": "X", "appium:sessionTimeout": 0.4}))),
    )
    .await;
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["value"]["error"], "session not created");
    assert!(body["value"]["message"]
        .as_str()
        .unwrap()
        .contains("no fresh live heartbeat"));

    let handle = registry.get("X").unwrap();
    assert!(handle.is_available_for_automation);
    assert!(!handle.is_running_automation);
    assert!(handle.session_id.is_empty());
    assert!(handle.in_use_by.is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn upstream_refusal_reverts_reservation() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    register(&app, provider, &[("BAD", "android", "13")]).await;

    let (status, body) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["value"]["error"], "unknown error");
    assert!(body["value"]["message"]
        .as_str()
        .unwrap()
        .contains("app missing"));

    let handle = registry.get("BAD").unwrap();
    assert!(handle.is_available_for_automation);
    assert!(!handle.is_running_automation);
    assert!(handle.session_id.is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn stale_provider_is_skipped_until_next_heartbeat() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    let stale = heartbeat(
        provider,
        &[("A1", "android", "13")],
        farm_proto::now_millis() - 4_000,
    );
    send(&app, "POST", "/provider-update", Some(stale)).await;

    let (status, body) = send(&app, "GET", "/grid/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"]["ready"], false);
    let (status, _) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    register(&app, provider, &[("A1", "android", "13")]).await;
    let (_, body) = send(&app, "GET", "/grid/status", None).await;
    assert_eq!(body["value"]["ready"], true);
    let (status, _) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    assert_eq!(status, StatusCode::OK);
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_session_and_command_are_404() {
    let registry = Arc::new(Registry::new());
    let app = hub(registry, None);

    let (status, body) = send(&app, "POST", "/grid/session/nope/url", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["value"]["error"], "invalid session id");

    let (status, body) = send(&app, "GET", "/grid/whatever", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["value"]["error"], "unknown command");

    let (status, body) = send(&app, "POST", "/grid/session", Some(json!("nope"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["value"]["error"], "invalid argument");
}

#[test_timeout::tokio_timeout_test(30)]
async fn human_control_conflicts_with_automation() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry.clone(), None);
    register(&app, provider, &[("A1", "android", "13"), ("A2", "android", "13")]).await;

    let (status, _) = send(&app, "POST", "/devices/A2/in-use", Some(json!({"user": "alice"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry.get("A2").unwrap().in_use_by, "alice");

    let (status, _) = send(&app, "POST", "/grid/session", Some(android_session(json!({})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry.get("A1").unwrap().in_use_by, "automation");

    let (status, _) = send(&app, "POST", "/devices/A1/in-use", Some(json!({"user": "bob"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "DELETE", "/devices/A2/in-use", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(registry.get("A2").unwrap().in_use_by.is_empty());

    let (status, _) = send(&app, "POST", "/devices/ZZ/in-use", Some(json!({"user": "bob"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test(30)]
async fn listings_echo_unknown_fields() {
    let provider = spawn_provider().await;
    let registry = Arc::new(Registry::new());
    let app = hub(registry, None);
    let mut update = heartbeat(provider, &[("A1", "android", "13")], farm_proto::now_millis());
    update["device_data"][0]["battery_level"] = json!(77);
    update["provider"]["rack"] = json!("R2");
    send(&app, "POST", "/provider-update", Some(update)).await;

    let (status, devices) = send(&app, "GET", "/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(devices[0]["udid"], "A1");
    assert_eq!(devices[0]["battery_level"], 77);
    assert_eq!(devices[0]["is_available_for_automation"], true);

    let (_, providers) = send(&app, "GET", "/providers", None).await;
    assert_eq!(providers[0]["rack"], "R2");
}

#[test_timeout::tokio_timeout_test(30)]
async fn heartbeat_persists_provider_record() {
    let provider = spawn_provider().await;
    let store = MemoryStore::new();
    let state = AppState::new(Arc::new(Registry::new()), store.clone(), settings(), None);
    let app = build_router(state, None);
    register(&app, provider, &[("A1", "android", "13")]).await;

    let providers = store.list_providers().await.unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].nickname, "lab-1");
    assert_eq!(providers[0].port, provider.port());
}

#[test_timeout::tokio_timeout_test(30)]
async fn auth_guards_client_routes_only() {
    let registry = Arc::new(Registry::new());
    let app = hub(registry, Some(Arc::new(AuthKeys::hs256("s3cret"))));

    let (status, body) = send(&app, "GET", "/devices", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["value"]["message"], "missing bearer token");

    let (status, _) = send(&app, "GET", "/grid/status", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/providers", None).await;
    assert_eq!(status, StatusCode::OK);
}

async fn fake_stream(ws: WebSocketUpgrade, Path(udid): Path<String>) -> axum::response::Response {
    ws.on_upgrade(move |mut socket| async move {
        if socket
            .send(WsMessage::Binary(format!("frame-{udid}").into_bytes()))
            .await
            .is_err()
        {
            return;
        }
        while let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
            if socket.send(WsMessage::Text(format!("echo:{text}"))).await.is_err() {
                break;
            }
        }
    })
}

#[test_timeout::tokio_timeout_test(30)]
async fn device_stream_is_relayed_over_websocket() {
    let app = Router::new().route("/device/:udid/android-stream", get(fake_stream));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let provider = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let hub_app = hub(Arc::new(Registry::new()), None);
    register(&hub_app, provider, &[("A1", "android", "13")]).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, hub_app).await.unwrap();
    });

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{hub_addr}/device/A1/android-stream"))
            .await
            .unwrap();
    match client.next().await.unwrap().unwrap() {
        UpstreamMessage::Binary(data) => assert_eq!(&data[..], b"frame-A1"),
        other => panic!("unexpected first message: {other:?}"),
    }
    client.send(UpstreamMessage::Text("hello".into())).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        UpstreamMessage::Text(text) => assert_eq!(text.as_str(), "echo:hello"),
        other => panic!("unexpected reply: {other:?}"),
    }

    let missing = tokio_tungstenite::connect_async(format!("ws://{hub_addr}/device/ZZ/android-stream")).await;
    assert!(missing.is_err());
}
