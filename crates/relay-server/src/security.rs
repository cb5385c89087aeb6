//! Security gates for the three surfaces: driver WebSocket, extension
//! WebSocket, and privileged HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use relay_kernel::Relay;

/// Origin check shared by both WebSocket surfaces: a present `Origin` header
/// must be `chrome-extension://<id>` with an allow-listed id.
pub fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Some(id) = origin.strip_prefix("chrome-extension://") else {
        return false;
    };
    let id = id.trim_end_matches('/');
    allowed.iter().any(|candidate| candidate == id)
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(key) {
            return parts.next().map(|value| value.to_string());
        }
    }
    None
}

fn remote_addr(request: &Request<Body>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Gate for `/extension`: loopback peers carrying an allow-listed
/// `chrome-extension://` origin only.
pub async fn extension_gate(
    State(relay): State<Arc<Relay>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(addr) = remote_addr(&request) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    if !addr.ip().is_loopback() {
        warn!(target: "relay-server", %addr, "extension upgrade from non-loopback address");
        return StatusCode::FORBIDDEN.into_response();
    }
    let headers = request.headers();
    let has_extension_origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("chrome-extension://"))
        .unwrap_or(false);
    if !has_extension_origin
        || !origin_allowed(headers, &relay.options().allowed_extension_ids)
    {
        warn!(target: "relay-server", "extension upgrade with unauthorized origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

/// Gate for `/cdp`: allow-listed origin when one is present (non-browser
/// drivers send none), plus the token when token mode is on.
pub async fn cdp_gate(
    State(relay): State<Arc<Relay>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !origin_allowed(request.headers(), &relay.options().allowed_extension_ids) {
        warn!(target: "relay-server", "driver upgrade with unauthorized origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    if let Some(expected) = relay.options().token.as_deref() {
        let supplied = query_param(request.uri().query(), "token");
        if supplied.as_deref() != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

/// Gate for privileged HTTP (`/cli/*`, `/recording/*`): block cross-origin
/// browser requests via `Sec-Fetch-Site`, force JSON bodies on POST so any
/// bypass attempt triggers a preflight, and check the token when enabled.
pub async fn privileged_gate(
    State(relay): State<Arc<Relay>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(site) = request
        .headers()
        .get("sec-fetch-site")
        .and_then(|value| value.to_str().ok())
    {
        if site != "same-origin" && site != "none" {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    if request.method() == Method::POST {
        let is_json = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
        }
    }

    if let Some(expected) = relay.options().token.as_deref() {
        let bearer = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|value| value.to_string());
        let query = query_param(request.uri().query(), "token");
        if bearer.as_deref() != Some(expected) && query.as_deref() != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    next.run(request).await
}
