//! CDP-compatible discovery endpoints plus relay status routes.
//!
//! Discovery never fails because the extension is offline: a relay with no
//! extension answers `/json/list` with an empty array, exactly like a
//! browser with no open tabs.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use relay_core_types::protocol::is_restricted_target;
use relay_kernel::{routing, Relay};
use relay_store::model::ExtensionEntry;

pub(crate) fn router() -> Router<Arc<Relay>> {
    Router::new()
        .route("/", get(root_handler))
        .route("/version", get(version_handler))
        .route("/extension/status", get(extension_status_handler))
        .route("/extensions/status", get(extensions_status_handler))
        .route("/json", get(json_list_handler).put(json_list_handler))
        .route("/json/", get(json_list_handler).put(json_list_handler))
        .route("/json/list", get(json_list_handler).put(json_list_handler))
        .route("/json/list/", get(json_list_handler).put(json_list_handler))
        .route(
            "/json/version",
            get(json_version_handler).put(json_version_handler),
        )
        .route(
            "/json/version/",
            get(json_version_handler).put(json_version_handler),
        )
}

pub(crate) fn privileged_router() -> Router<Arc<Relay>> {
    Router::new()
        .route("/cli/*path", post(cli_handler))
        .route("/recording/*path", post(recording_handler))
}

async fn root_handler() -> &'static str {
    "OK"
}

async fn version_handler() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

fn extension_summary(entry: &ExtensionEntry) -> Value {
    json!({
        "id": entry.id.0,
        "stableKey": entry.stable_key.0,
        "browser": entry.info.browser,
        "email": entry.info.email,
        "profileId": entry.info.profile_id,
        "extensionVersion": entry.info.version,
        "connected": entry.sink.is_some(),
        "connectedAt": entry.connected_at.to_rfc3339(),
        "targetCount": entry.connected_targets.len(),
    })
}

async fn extension_status_handler(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let state = relay.store().state();
    let mut entries: Vec<_> = state.extensions.values().collect();
    entries.sort_by_key(|entry| entry.seq);
    let first = entries.first().map(|entry| extension_summary(entry));
    Json(json!({
        "connected": first.is_some(),
        "extension": first,
    }))
}

async fn extensions_status_handler(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let state = relay.store().state();
    let mut entries: Vec<_> = state.extensions.values().collect();
    entries.sort_by_key(|entry| entry.seq);
    let summaries: Vec<Value> = entries
        .into_iter()
        .map(|entry| extension_summary(entry))
        .collect();
    Json(json!({ "extensions": summaries }))
}

fn ws_debugger_url(relay: &Relay) -> String {
    let options = relay.options();
    format!("ws://{}:{}/cdp", options.host, options.port)
}

async fn json_list_handler(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let state = relay.store().state();
    let allowed = &relay.options().allowed_extension_ids;
    let ws_url = ws_debugger_url(&relay);

    let targets: Vec<Value> = routing::resolve_extension(&state, None, true)
        .map(|entry| {
            let mut targets: Vec<_> = entry.connected_targets.values().cloned().collect();
            targets.sort_by(|a, b| a.session_id.0.cmp(&b.session_id.0));
            targets
                .into_iter()
                .filter(|target| !is_restricted_target(&target.target_info, allowed))
                .map(|target| {
                    json!({
                        "id": target.target_id.0,
                        "type": target.target_info.kind,
                        "title": target.target_info.title,
                        "description": "",
                        "url": target.target_info.url,
                        "webSocketDebuggerUrl": ws_url.clone(),
                        "devtoolsFrontendUrl": format!(
                            "/devtools/inspector.html?ws={}",
                            ws_url.trim_start_matches("ws://")
                        ),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Json(Value::Array(targets))
}

async fn json_version_handler(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let version = env!("CARGO_PKG_VERSION");
    Json(json!({
        "Browser": format!("Chrome/CdpRelay-{version}"),
        "Protocol-Version": "1.3",
        "User-Agent": format!("CdpRelay/{version}"),
        "webSocketDebuggerUrl": ws_debugger_url(&relay),
    }))
}

async fn cli_handler(
    State(relay): State<Arc<Relay>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match relay.cli().handle(&path, body).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

async fn recording_handler(
    State(relay): State<Arc<Relay>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match relay.recording().handle_http(&path, body).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}
