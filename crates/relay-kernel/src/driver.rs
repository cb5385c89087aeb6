//! Driver-facing session logic: client registration and the per-frame CDP
//! command dispatch. The surrounding read loop lives in `relay-server` and
//! awaits each command before reading the next frame, so responses are
//! delivered in command order.

use std::cell::Cell;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, trace};

use relay_core_types::protocol::{DriverCommand, DriverResponse};
use relay_core_types::{ClientId, ExtensionConnId, RelayError};
use relay_event_bus::RelayEvent;
use relay_store::model::{MessageSink, PlaywrightClient};
use relay_store::transitions;

use crate::{emulator, routing, send_json, Relay};

impl Relay {
    /// Bind a driver to an extension. Fails when the client id is already
    /// taken; the existing driver is unaffected.
    pub async fn register_client(
        self: &Arc<Self>,
        id: ClientId,
        extension_id: ExtensionConnId,
        sink: Arc<dyn MessageSink>,
    ) -> Result<(), RelayError> {
        let inserted = Cell::new(false);
        self.store().set_state(|state| {
            if state.playwright_clients.contains_key(&id) {
                return None;
            }
            inserted.set(true);
            Some(transitions::add_playwright_client(
                state,
                PlaywrightClient {
                    id: id.clone(),
                    extension_id: extension_id.clone(),
                    sink: sink.clone(),
                },
            ))
        });
        if !inserted.get() {
            return Err(RelayError::DuplicateClient(id.0));
        }
        info!(target: "relay", client = %id.0, extension = %extension_id.0, "driver connected");
        self.bus().publish(RelayEvent::ClientConnected { client: id });
        Ok(())
    }

    pub async fn unregister_client(self: &Arc<Self>, id: &ClientId) {
        let removed = Cell::new(false);
        self.store().set_state(|state| {
            let next = transitions::remove_playwright_client(state, id)?;
            removed.set(true);
            Some(next)
        });
        if removed.get() {
            info!(target: "relay", client = %id.0, "driver disconnected");
            self.bus()
                .publish(RelayEvent::ClientDisconnected { client: id.clone() });
        }
    }

    /// Handle one text frame from a driver socket. Malformed JSON is
    /// silently dropped; every parsed command produces exactly one response.
    pub async fn on_driver_command(self: &Arc<Self>, client_id: &ClientId, text: &str) {
        let command: DriverCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(err) => {
                debug!(target: "relay", client = %client_id.0, ?err, "dropping malformed driver frame");
                return;
            }
        };
        trace!(target: "cdp_frames", client = %client_id.0, %text, "driver -> relay");
        self.bus().publish(RelayEvent::CdpCommand {
            client: client_id.clone(),
            method: command.method.clone(),
            frame: serde_json::to_value(&command).unwrap_or(Value::Null),
        });

        let state = self.store().state();
        let Some(client) = state.playwright_clients.get(client_id).cloned() else {
            return;
        };

        let response = match routing::resolve_for_client(&state, &client) {
            None => DriverResponse::err(
                command.id,
                command.session_id.clone(),
                RelayError::ExtensionNotConnected.to_string(),
            ),
            Some(entry) => match emulator::dispatch(self, &entry, &client, &command).await {
                Ok(result) => DriverResponse::ok(command.id, command.session_id.clone(), result),
                Err(err) => {
                    DriverResponse::err(command.id, command.session_id.clone(), err.to_string())
                }
            },
        };

        send_json(&client.sink, &response, "driver response").await;
        self.bus().publish(RelayEvent::CdpResponse {
            client: client_id.clone(),
            method: command.method,
            frame: serde_json::to_value(&response).unwrap_or(Value::Null),
        });
    }
}
