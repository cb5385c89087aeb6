//! HTTP + WebSocket surface of the CDP relay.
//!
//! One axum router hosts both WebSocket endpoints, the CDP discovery
//! surface, status routes, and the gated privileged routes. The kernel is
//! shared as router state; this crate contains no relay logic of its own.

mod discovery;
mod security;
mod sinks;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use relay_kernel::Relay;

pub use sinks::WsSink;

/// Build the complete router for a relay instance.
pub fn build_router(relay: Arc<Relay>) -> Router {
    let privileged = discovery::privileged_router().layer(middleware::from_fn_with_state(
        relay.clone(),
        security::privileged_gate,
    ));

    Router::new()
        .merge(discovery::router())
        .merge(privileged)
        .merge(ws::router(relay.clone()))
        .layer(cors_layer(&relay.options().allowed_extension_ids))
        .with_state(relay)
}

/// CORS is restricted to allow-listed extension origins; everything else is
/// covered by the same-origin policy plus the privileged gate.
fn cors_layer(allowed_extension_ids: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_extension_ids
        .iter()
        .filter_map(|id| HeaderValue::from_str(&format!("chrome-extension://{id}")).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

/// Bind and serve until the process exits.
pub async fn serve(relay: Arc<Relay>) -> anyhow::Result<()> {
    let addr = SocketAddr::new(relay.options().host, relay.options().port);
    let router = build_router(relay);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;
    info!(target: "relay-server", %addr, "relay listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("relay http server exited unexpectedly")?;
    Ok(())
}
