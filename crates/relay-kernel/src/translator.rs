//! Translates extension-forwarded CDP events into state transitions and
//! driver-bound frames.
//!
//! Fan-out is scoped to the drivers bound to the source extension. Iframe
//! attach events are re-parented onto the owning page's session via the
//! `frame_ids` bookkeeping; when that lookup loses the race with
//! `Page.frameAttached`, the event falls back to the incoming session id —
//! delivering on the browser session instead would make the driver detach
//! the iframe and leave it paused.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use relay_core_types::protocol::{is_restricted_target, CdpEventPayload, DriverEvent, TargetInfo};
use relay_core_types::{CdpSessionId, ExtensionConnId, FrameId};
use relay_event_bus::RelayEvent;
use relay_store::model::ConnectedTarget;
use relay_store::{queries, transitions};

use crate::{send_json, Relay};

pub async fn handle_event(relay: &Arc<Relay>, extension: &ExtensionConnId, event: CdpEventPayload) {
    trace!(
        target: "cdp_frames",
        extension = %extension.0,
        method = %event.method,
        session = event.session_id.as_ref().map(|s| s.0.as_str()).unwrap_or(""),
        "extension -> relay event"
    );
    relay.bus().publish(RelayEvent::CdpEvent {
        extension: extension.clone(),
        method: event.method.clone(),
        session_id: event.session_id.clone(),
        params: event.params.clone(),
    });

    match event.method.as_str() {
        "Target.attachedToTarget" => {
            handle_attached_to_target(relay, extension, event).await;
        }
        "Target.detachedFromTarget" => {
            if let Some(session) = param_str(&event.params, "sessionId") {
                let session = CdpSessionId(session);
                relay
                    .store()
                    .set_state(|state| transitions::remove_target(state, extension, &session));
            }
            fan_out(relay, extension, &event).await;
        }
        "Target.targetCrashed" => {
            if let Some(target_id) = param_str(&event.params, "targetId") {
                let target_id = relay_core_types::TargetId(target_id);
                relay.store().set_state(|state| {
                    transitions::remove_target_by_crash(state, extension, &target_id)
                });
            }
            fan_out(relay, extension, &event).await;
        }
        "Target.targetInfoChanged" => {
            if let Some(info) = parse_target_info(&event.params) {
                relay
                    .store()
                    .set_state(|state| transitions::update_target_info(state, extension, info));
            }
            fan_out(relay, extension, &event).await;
        }
        "Page.frameAttached" => {
            if let (Some(session), Some(frame_id)) = (
                event.session_id.clone(),
                param_str(&event.params, "frameId"),
            ) {
                relay.store().set_state(|state| {
                    transitions::add_frame_id(state, extension, &session, FrameId(frame_id))
                });
            }
            fan_out(relay, extension, &event).await;
        }
        "Page.frameDetached" => {
            if let Some(frame_id) = param_str(&event.params, "frameId") {
                let frame_id = FrameId(frame_id);
                relay
                    .store()
                    .set_state(|state| transitions::remove_frame_id(state, extension, &frame_id));
            }
            fan_out(relay, extension, &event).await;
        }
        "Page.frameNavigated" => {
            handle_frame_navigated(relay, extension, &event);
            fan_out(relay, extension, &event).await;
        }
        "Page.navigatedWithinDocument" => {
            if let (Some(session), Some(url)) =
                (event.session_id.clone(), param_str(&event.params, "url"))
            {
                relay.store().set_state(|state| {
                    transitions::update_target_url(state, extension, &session, &url, None)
                });
            }
            fan_out(relay, extension, &event).await;
        }
        _ => {
            fan_out(relay, extension, &event).await;
        }
    }
}

/// A new (or re-announced) target session. Restricted targets are released
/// if paused and never surfaced; fresh visible targets are re-emitted under
/// the page-owner session when they are OOPIFs.
async fn handle_attached_to_target(
    relay: &Arc<Relay>,
    extension: &ExtensionConnId,
    event: CdpEventPayload,
) {
    let Some(session) = param_str(&event.params, "sessionId").map(CdpSessionId) else {
        debug!(target: "relay", extension = %extension.0, "attachedToTarget without sessionId");
        return;
    };
    let Some(info) = parse_target_info(&event.params) else {
        debug!(target: "relay", extension = %extension.0, "attachedToTarget without targetInfo");
        return;
    };
    let waiting = event
        .params
        .get("waitingForDebugger")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if is_restricted_target(&info, &relay.options().allowed_extension_ids) {
        debug!(target: "relay", url = %info.url, kind = %info.kind, "suppressing restricted target");
        if waiting {
            // Spawned: this runs inside the extension read loop, and the
            // release response arrives over that same loop.
            let state = relay.store().state();
            if let Some(entry) = state.extensions.get(extension).cloned() {
                let relay = relay.clone();
                tokio::spawn(async move {
                    if let Err(err) = relay
                        .forward_cdp_command(
                            &entry,
                            Some(&session),
                            "Runtime.runIfWaitingForDebugger",
                            None,
                            None,
                        )
                        .await
                    {
                        debug!(target: "relay", %err, "failed to release restricted target");
                    }
                });
            }
        }
        return;
    }

    let state = relay.store().state();
    let was_known = state
        .extensions
        .get(extension)
        .map(|entry| entry.connected_targets.contains_key(&session))
        .unwrap_or(false);

    relay.store().set_state(|state| {
        transitions::add_target(
            state,
            extension,
            ConnectedTarget::new(session.clone(), info.clone()),
        )
    });

    if was_known {
        return;
    }

    let outer_session = if info.kind == "iframe" {
        parent_session(relay, extension, &event.params).or_else(|| event.session_id.clone())
    } else {
        event.session_id.clone()
    };
    let frame = DriverEvent {
        method: event.method.clone(),
        session_id: outer_session,
        params: Some(event.params.clone()),
        server_generated: None,
    };
    deliver(relay, extension, &frame).await;
}

/// Map an iframe's `parentFrameId` to the session of the page target whose
/// frame set holds it.
fn parent_session(
    relay: &Arc<Relay>,
    extension: &ExtensionConnId,
    params: &Value,
) -> Option<CdpSessionId> {
    let parent_frame = params
        .get("parentFrameId")
        .and_then(Value::as_str)
        .or_else(|| {
            params
                .get("targetInfo")
                .and_then(|info| info.get("parentFrameId"))
                .and_then(Value::as_str)
        })?;
    let parent_frame = FrameId(parent_frame.to_string());
    let state = relay.store().state();
    let entry = state.extensions.get(extension)?;
    queries::find_target_by_frame(entry, &parent_frame).map(|target| target.session_id.clone())
}

fn handle_frame_navigated(relay: &Arc<Relay>, extension: &ExtensionConnId, event: &CdpEventPayload) {
    let Some(session) = event.session_id.clone() else {
        return;
    };
    let Some(frame) = event.params.get("frame") else {
        return;
    };
    if let Some(frame_id) = frame.get("id").and_then(Value::as_str) {
        let frame_id = FrameId(frame_id.to_string());
        relay.store().set_state(|state| {
            transitions::add_frame_id(state, extension, &session, frame_id)
        });
    }
    let is_main = frame.get("parentId").and_then(Value::as_str).is_none();
    if is_main {
        if let Some(url) = frame.get("url").and_then(Value::as_str) {
            let title = frame.get("name").and_then(Value::as_str);
            relay.store().set_state(|state| {
                transitions::update_target_url(state, extension, &session, url, title)
            });
        }
    }
}

/// Forward an event verbatim under its incoming session id.
async fn fan_out(relay: &Arc<Relay>, extension: &ExtensionConnId, event: &CdpEventPayload) {
    let frame = DriverEvent {
        method: event.method.clone(),
        session_id: event.session_id.clone(),
        params: Some(event.params.clone()),
        server_generated: None,
    };
    deliver(relay, extension, &frame).await;
}

/// Deliver only to drivers bound to the source extension.
async fn deliver(relay: &Arc<Relay>, extension: &ExtensionConnId, frame: &DriverEvent) {
    let state = relay.store().state();
    for client in queries::clients_for_extension(&state, extension) {
        send_json(&client.sink, frame, "event fan-out").await;
    }
}

fn param_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_target_info(params: &Value) -> Option<TargetInfo> {
    params
        .get("targetInfo")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
}
