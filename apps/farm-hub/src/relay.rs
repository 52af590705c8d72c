//! Routes session-scoped calls to the provider that owns the session.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::Method;
use axum::response::Response;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::GridError;
use crate::proxy;
use crate::registry::{Registry, SessionTarget};
use crate::state::AppState;

/// Command bodies are buffered; file pushes arrive base64-encoded and can be large.
const MAX_COMMAND_BODY: usize = 256 * 1024 * 1024;

/// Stamps session activity when dropped, i.e. once the proxied response body
/// has been fully written or abandoned.
struct ActivityGuard {
    registry: Arc<Registry>,
    udid: String,
    session_id: String,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.registry
            .touch(&self.udid, &self.session_id, farm_proto::now_millis());
    }
}

pub async fn forward_session_call(state: AppState, req: Request) -> Result<Response, GridError> {
    let sid = proxy::session_id_from_path(req.uri().path())
        .ok_or_else(|| GridError::UnknownCommand(req.uri().path().to_string()))?
        .to_string();
    let target = state
        .registry
        .find_session(&sid)
        .ok_or_else(|| GridError::SessionNotFound(sid.clone()))?;

    if req.method() == Method::DELETE {
        return delete_session(state, target, req).await;
    }

    let guard = ActivityGuard {
        registry: state.registry.clone(),
        udid: target.udid.clone(),
        session_id: target.session_id.clone(),
    };
    let upstream = send_upstream(&state, &target, req).await?;

    let status = upstream.status();
    let headers = proxy::response_headers(upstream.headers());
    let body = upstream.bytes_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Forwards the DELETE, then releases the device whatever the provider said.
async fn delete_session(
    state: AppState,
    target: SessionTarget,
    req: Request,
) -> Result<Response, GridError> {
    let outcome = match send_upstream(&state, &target, req).await {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = proxy::response_headers(upstream.headers());
            upstream
                .bytes()
                .await
                .map(|bytes| (status, headers, bytes))
                .map_err(GridError::from)
        }
        Err(err) => Err(err),
    };

    let registry = state.registry.clone();
    registry.touch(&target.udid, &target.session_id, farm_proto::now_millis());
    if let Some(marker) = registry.release_on_delete(&target.udid, &target.session_id) {
        info!(udid = %target.udid, session_id = %target.session_id, "session deleted");
        let grace = state.grid.delete_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.finalize_delete(&target.udid, &target.session_id, marker) {
                debug!(udid = %target.udid, session_id = %target.session_id, "lease finalized");
            }
        });
    }

    match outcome {
        Ok((status, headers, bytes)) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        Err(err) => {
            warn!(error = %err, "provider call failed while deleting session");
            Err(err)
        }
    }
}

async fn send_upstream(
    state: &AppState,
    target: &SessionTarget,
    req: Request,
) -> Result<reqwest::Response, GridError> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_COMMAND_BODY)
        .await
        .map_err(|err| GridError::InvalidArgument(format!("unreadable request body: {err}")))?;
    let url = proxy::with_query(
        format!(
            "{}/device/{}/appium{}",
            target.base_url,
            target.udid,
            proxy::upstream_path(parts.uri.path())
        ),
        parts.uri.query(),
    );
    debug!(method = %parts.method, url = %url, "relaying session call");
    state
        .http
        .request(parts.method, &url)
        .headers(proxy::request_headers(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(GridError::from)
}
