//! Header and path plumbing shared by every hub → provider forward.

use axum::http::header::{self, HeaderMap, HeaderName};

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Path on the provider's automation proxy: `/grid/session/x` → `/session/x`.
pub fn upstream_path(path: &str) -> &str {
    match path.strip_prefix("/grid") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Session id from `…/session/<sid>[/…]`, `None` when absent or empty.
pub fn session_id_from_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("/session/")?;
    let sid = rest.split('/').next().unwrap_or_default();
    (!sid.is_empty()).then_some(sid)
}

pub fn request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = strip(incoming);
    headers.remove(header::CONTENT_LENGTH);
    headers
}

/// Upstream response headers with hop-by-hop fields and CORS origin removed;
/// the hub applies its own CORS policy.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = strip(upstream);
    headers.remove(header::ACCESS_CONTROL_ALLOW_ORIGIN);
    headers.remove(header::CONTENT_LENGTH);
    headers
}

fn strip(source: &HeaderMap) -> HeaderMap {
    let mut headers = source.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

pub fn with_query(url: String, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{url}?{q}"),
        _ => url,
    }
}
