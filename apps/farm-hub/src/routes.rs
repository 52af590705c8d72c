use std::path::PathBuf;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::devices;
use crate::dispatcher;
use crate::error::GridError;
use crate::relay;
use crate::state::AppState;

const MAX_SESSION_BODY: usize = 16 * 1024 * 1024;

pub fn build_router(state: AppState, ui_files_dir: Option<PathBuf>) -> Router {
    let client_routes = Router::new()
        .route("/grid/*rest", any(grid_entry))
        .route("/devices", get(devices::list_devices))
        .route(
            "/devices/:udid/in-use",
            post(devices::claim_control).delete(devices::release_control),
        )
        .route("/device/:udid/*rest", any(devices::forward_device))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let provider_routes = Router::new()
        .route("/health", get(health))
        .route("/provider-update", post(devices::provider_update))
        .route("/providers", get(devices::list_providers));

    let mut app = client_routes.merge(provider_routes).with_state(state);
    if let Some(dir) = ui_files_dir {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }
    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "devices": state.registry.snapshot().len(),
    }))
}

/// Single entry for the WebDriver surface under `/grid`.
async fn grid_entry(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let method = req.method().clone();

    let result = if method == Method::POST && path.ends_with("/session") {
        new_session(state, req).await
    } else if path.contains("/session/") {
        relay::forward_session_call(state, req).await
    } else if method == Method::GET && path == "/grid/status" {
        Ok(grid_status(&state))
    } else {
        Err(GridError::UnknownCommand(format!("{method} {path}")))
    };
    result.into_response()
}

async fn new_session(state: AppState, req: Request) -> Result<Response, GridError> {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, MAX_SESSION_BODY)
        .await
        .map_err(|err| GridError::InvalidArgument(format!("unreadable session body: {err}")))?;
    dispatcher::create_session(state, parts.uri, parts.headers, body).await
}

fn grid_status(state: &AppState) -> Response {
    let ready = state.registry.any_eligible(state.window());
    let message = if ready {
        "farm has free devices"
    } else {
        "no free devices"
    };
    Json(json!({"value": {"ready": ready, "message": message}})).into_response()
}
