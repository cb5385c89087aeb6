//! WebSocket endpoints: `/cdp[/:client_id]` for drivers and `/extension`
//! for browser extensions. Gates that map to HTTP status codes run as
//! middleware before the upgrade; failures that map to WS close codes
//! (4003, 4004) happen right after it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tracing::{debug, error, info};

use relay_core_types::protocol::ExtensionInfo;
use relay_core_types::{close, ClientId};
use relay_kernel::{routing, Relay};
use relay_store::MessageSink;

use crate::security;
use crate::sinks::WsSink;

pub(crate) fn router(relay: Arc<Relay>) -> Router<Arc<Relay>> {
    let cdp = Router::new()
        .route("/cdp", get(cdp_handler))
        .route("/cdp/:client_id", get(cdp_handler_with_id))
        .layer(middleware::from_fn_with_state(
            relay.clone(),
            security::cdp_gate,
        ));
    let extension = Router::new()
        .route("/extension", get(extension_handler))
        .layer(middleware::from_fn_with_state(relay, security::extension_gate));
    cdp.merge(extension)
}

async fn cdp_handler(
    State(relay): State<Arc<Relay>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade_driver(relay, ws, None, params)
}

async fn cdp_handler_with_id(
    State(relay): State<Arc<Relay>>,
    Path(client_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade_driver(relay, ws, Some(client_id), params)
}

fn upgrade_driver(
    relay: Arc<Relay>,
    ws: WebSocketUpgrade,
    client_id: Option<String>,
    params: HashMap<String, String>,
) -> impl IntoResponse {
    let client_id = ClientId(client_id.unwrap_or_else(|| "default".to_string()));
    let selector = params.get("extensionId").cloned();
    ws.on_upgrade(move |socket| async move {
        drive_driver_socket(relay, socket, client_id, selector).await;
    })
}

async fn drive_driver_socket(
    relay: Arc<Relay>,
    mut socket: WebSocket,
    client_id: ClientId,
    selector: Option<String>,
) {
    let resolved = routing::resolve_extension(&relay.store().state(), selector.as_deref(), true);
    let Some(extension) = resolved else {
        let reason = match selector.as_deref() {
            Some(selector) => format!("No extension matches '{selector}'"),
            None => "No extension connected".to_string(),
        };
        close_raw(&mut socket, close::NO_EXTENSION, &reason).await;
        return;
    };

    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink::new(sender));
    if let Err(err) = relay
        .register_client(client_id.clone(), extension.id.clone(), sink.clone())
        .await
    {
        info!(target: "relay-server", client = %client_id.0, %err, "rejecting duplicate driver");
        sink.close(close::DUPLICATE_CLIENT, "Client id already in use")
            .await;
        return;
    }

    // Each command is awaited before the next frame is read, which is what
    // gives drivers responses in command order.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                relay.on_driver_command(&client_id, &text).await;
            }
            Ok(Message::Close(frame)) => {
                debug!(target: "relay-server", client = %client_id.0, ?frame, "driver closed");
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                debug!(target: "relay-server", client = %client_id.0, ?err, "driver socket error");
                break;
            }
        }
    }
    relay.unregister_client(&client_id).await;
}

async fn extension_handler(
    State(relay): State<Arc<Relay>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let info = ExtensionInfo {
        browser: params.get("browser").cloned(),
        email: params.get("email").cloned(),
        profile_id: params.get("id").cloned(),
        version: params.get("v").cloned(),
    };
    ws.on_upgrade(move |socket| async move {
        drive_extension_socket(relay, socket, info).await;
    })
}

async fn drive_extension_socket(relay: Arc<Relay>, socket: WebSocket, info: ExtensionInfo) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink::new(sender));
    let id = relay.register_extension(info, sink).await;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                relay.on_extension_text(&id, &text).await;
            }
            Ok(Message::Binary(payload)) => {
                relay.on_extension_binary(&id, payload).await;
            }
            Ok(Message::Close(frame)) => {
                debug!(target: "relay-server", extension = %id.0, ?frame, "extension closed");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                error!(target: "relay-server", extension = %id.0, ?err, "extension socket error");
                break;
            }
        }
    }
    relay.unregister_extension(&id).await;
}

async fn close_raw(socket: &mut WebSocket, code: u16, reason: &str) {
    use axum::extract::ws::CloseFrame;
    use std::borrow::Cow;

    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    }));
    if let Err(err) = socket.send(frame).await {
        debug!(target: "relay-server", ?err, code, "failed to send close frame");
    }
}
