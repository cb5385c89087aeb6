//! Driver-facing CDP emulation.
//!
//! A small, compatibility-critical subset of CDP is answered locally so the
//! driver believes it is talking to a normal Chromium endpoint; everything
//! else is forwarded verbatim to the owning extension.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use relay_core_types::protocol::{is_restricted_target, DriverCommand, DriverEvent, TargetInfo};
use relay_core_types::{CdpSessionId, RelayError};
use relay_event_bus::RelayEvent;
use relay_store::model::{ConnectedTarget, ExtensionEntry, PlaywrightClient};
use relay_store::transitions;

use crate::{send_json, Relay};

/// Dispatch one driver command against its resolved extension. Events
/// synthesized here are delivered to the issuing driver only, before the
/// response is written, matching CDP's event-then-response convention.
pub async fn dispatch(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
    client: &Arc<PlaywrightClient>,
    command: &DriverCommand,
) -> Result<Value, RelayError> {
    match command.method.as_str() {
        "Browser.getVersion" => Ok(browser_version()),
        "Browser.setDownloadBehavior" => Ok(json!({})),
        "Target.setAutoAttach" if command.session_id.is_none() => {
            set_auto_attach(relay, entry, client, command).await
        }
        "Target.setDiscoverTargets" => set_discover_targets(relay, entry, client, command).await,
        "Target.attachToTarget" => attach_to_target(relay, entry, client, command).await,
        "Target.getTargetInfo" => get_target_info(relay, entry, command),
        "Target.getTargets" => Ok(get_targets(relay, entry)),
        "Target.createTarget" | "Target.closeTarget" => {
            relay
                .send_to_extension_entry(
                    entry,
                    &command.method,
                    command.params.clone().unwrap_or_else(|| json!({})),
                )
                .await
        }
        "Runtime.enable" if command.session_id.is_some() => {
            runtime_enable(relay, entry, command).await
        }
        _ => {
            relay
                .forward_cdp_command(
                    entry,
                    command.session_id.as_ref(),
                    &command.method,
                    command.params.clone(),
                    command.source.as_deref(),
                )
                .await
        }
    }
}

fn browser_version() -> Value {
    let version = env!("CARGO_PKG_VERSION");
    json!({
        "protocolVersion": "1.3",
        "product": format!("Chrome/CdpRelay-{version}"),
        "userAgent": format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/CdpRelay-{version} Safari/537.36"
        ),
    })
}

/// `Target.setAutoAttach` on the browser session: enable native auto-attach
/// in the extension, optionally create the first tab, then replay an attach
/// event for every visible target so the driver learns about pre-existing
/// tabs.
async fn set_auto_attach(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
    client: &Arc<PlaywrightClient>,
    command: &DriverCommand,
) -> Result<Value, RelayError> {
    relay
        .forward_cdp_command(
            entry,
            None,
            &command.method,
            command.params.clone(),
            command.source.as_deref(),
        )
        .await?;

    if relay.options().auto_create_tab {
        let current = relay.store().state();
        let no_targets = current
            .extensions
            .get(&entry.id)
            .map(|e| e.connected_targets.is_empty())
            .unwrap_or(true);
        if no_targets {
            create_initial_tab(relay, entry).await;
        }
    }

    for (session_id, target) in visible_targets(relay, entry) {
        let event = attached_event(&session_id, &target.target_info, true);
        send_json(&client.sink, &event, "auto-attach replay").await;
    }
    Ok(json!({}))
}

async fn create_initial_tab(relay: &Arc<Relay>, entry: &Arc<ExtensionEntry>) {
    match relay
        .send_to_extension_entry(entry, "createTab", json!({}))
        .await
    {
        Ok(result) => {
            let session_id = result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(|s| CdpSessionId(s.to_string()));
            let info: Option<TargetInfo> = result
                .get("targetInfo")
                .cloned()
                .and_then(|raw| serde_json::from_value(raw).ok());
            if let (Some(session_id), Some(info)) = (session_id, info) {
                relay.store().set_state(|state| {
                    transitions::add_target(state, &entry.id, ConnectedTarget::new(session_id, info))
                });
            } else {
                warn!(target: "relay", extension = %entry.id.0, "createTab response missing session or target info");
            }
        }
        Err(err) => {
            warn!(target: "relay", extension = %entry.id.0, %err, "initial tab creation failed");
        }
    }
}

async fn set_discover_targets(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
    client: &Arc<PlaywrightClient>,
    command: &DriverCommand,
) -> Result<Value, RelayError> {
    let discover = command
        .params
        .as_ref()
        .and_then(|p| p.get("discover"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if discover {
        for (_, target) in visible_targets(relay, entry) {
            let event = DriverEvent {
                method: "Target.targetCreated".into(),
                session_id: None,
                params: Some(json!({ "targetInfo": attached_info(&target.target_info) })),
                server_generated: Some(true),
            };
            send_json(&client.sink, &event, "discover replay").await;
        }
    }
    Ok(json!({}))
}

/// The driver asks to attach to a target the extension already holds; hand
/// back the existing session instead of attaching twice.
async fn attach_to_target(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
    client: &Arc<PlaywrightClient>,
    command: &DriverCommand,
) -> Result<Value, RelayError> {
    let target_id = command
        .params
        .as_ref()
        .and_then(|p| p.get("targetId"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let state = relay.store().state();
    let target = state
        .extensions
        .get(&entry.id)
        .and_then(|e| {
            e.connected_targets
                .values()
                .find(|t| t.target_id.0 == target_id)
        })
        .cloned()
        .ok_or_else(|| RelayError::TargetNotFound(target_id.clone()))?;

    let event = attached_event(&target.session_id, &target.target_info, true);
    send_json(&client.sink, &event, "attach-to-target").await;
    Ok(json!({ "sessionId": target.session_id.0 }))
}

fn get_target_info(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
    command: &DriverCommand,
) -> Result<Value, RelayError> {
    let state = relay.store().state();
    let entry = state
        .extensions
        .get(&entry.id)
        .ok_or(RelayError::ExtensionNotConnected)?;

    let requested = command
        .params
        .as_ref()
        .and_then(|p| p.get("targetId"))
        .and_then(Value::as_str);
    let target = if let Some(target_id) = requested {
        entry
            .connected_targets
            .values()
            .find(|t| t.target_id.0 == target_id)
            .ok_or_else(|| RelayError::TargetNotFound(target_id.to_string()))?
    } else if let Some(session) = command.session_id.as_ref() {
        entry
            .connected_targets
            .get(session)
            .ok_or_else(|| RelayError::TargetNotFound(session.0.clone()))?
    } else {
        entry
            .connected_targets
            .values()
            .next()
            .ok_or_else(|| RelayError::TargetNotFound("<none>".into()))?
    };
    Ok(json!({ "targetInfo": attached_info(&target.target_info) }))
}

fn get_targets(relay: &Arc<Relay>, entry: &Arc<ExtensionEntry>) -> Value {
    let infos: Vec<Value> = visible_targets(relay, entry)
        .into_iter()
        .map(|(_, target)| attached_info(&target.target_info))
        .collect();
    json!({ "targetInfos": infos })
}

/// Drivers expect `Runtime.enable` to be immediately usable, so after
/// forwarding we wait (bounded) for the default execution context to appear
/// on the same session before releasing the response.
async fn runtime_enable(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
    command: &DriverCommand,
) -> Result<Value, RelayError> {
    let session = command
        .session_id
        .clone()
        .ok_or_else(|| RelayError::Internal("Runtime.enable without session".into()))?;
    let mut events = relay.bus().subscribe();

    let result = relay
        .forward_cdp_command(
            entry,
            Some(&session),
            &command.method,
            command.params.clone(),
            command.source.as_deref(),
        )
        .await?;

    let wait = relay.options().runtime_enable_wait;
    let latch = timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(RelayEvent::CdpEvent {
                    method,
                    session_id,
                    params,
                    ..
                }) if method == "Runtime.executionContextCreated"
                    && session_id.as_ref() == Some(&session) =>
                {
                    let is_default = params
                        .pointer("/context/auxData/isDefault")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if is_default {
                        break;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    if latch.is_err() {
        debug!(target: "relay", session = %session.0, "default execution context did not appear in time");
    }
    Ok(result)
}

/// Targets the driver is allowed to see, restricted ones filtered out.
fn visible_targets(
    relay: &Arc<Relay>,
    entry: &Arc<ExtensionEntry>,
) -> Vec<(CdpSessionId, ConnectedTarget)> {
    let allowed = &relay.options().allowed_extension_ids;
    let state = relay.store().state();
    let Some(entry) = state.extensions.get(&entry.id) else {
        return Vec::new();
    };
    let mut targets: Vec<(CdpSessionId, ConnectedTarget)> = entry
        .connected_targets
        .iter()
        .filter(|(_, target)| !is_restricted_target(&target.target_info, allowed))
        .map(|(session, target)| (session.clone(), target.clone()))
        .collect();
    targets.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
    targets
}

fn attached_info(info: &TargetInfo) -> Value {
    let mut encoded = serde_json::to_value(info).unwrap_or_else(|_| json!({}));
    encoded["attached"] = json!(true);
    encoded
}

pub(crate) fn attached_event(
    session_id: &CdpSessionId,
    info: &TargetInfo,
    server_generated: bool,
) -> DriverEvent {
    DriverEvent {
        method: "Target.attachedToTarget".into(),
        session_id: None,
        params: Some(json!({
            "sessionId": session_id.0,
            "targetInfo": attached_info(info),
            "waitingForDebugger": false,
        })),
        server_generated: server_generated.then_some(true),
    }
}
