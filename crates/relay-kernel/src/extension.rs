//! Per-extension WebSocket I/O: the outbound request/response pipeline, the
//! inbound frame dispatcher, keep-alive, and connection teardown.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use relay_core_types::protocol::{
    CdpEventPayload, ExtensionFrame, ExtensionInfo, ExtensionRequest,
};
use relay_core_types::{close, CdpSessionId, ExtensionConnId, RelayError};
use relay_event_bus::RelayEvent;
use relay_store::model::{ExtensionEntry, MessageSink};
use relay_store::{queries, transitions};

use crate::collab::RecordingFrame;
use crate::{routing, translator, Relay};

impl Relay {
    /// Admit a freshly upgraded extension socket. If a live entry already
    /// holds the same stable key it is closed with 4001; its entry lingers
    /// until its own close handler runs, keeping in-flight responses
    /// routable while new traffic flows to this connection.
    pub async fn register_extension(
        self: &Arc<Self>,
        info: ExtensionInfo,
        sink: Arc<dyn MessageSink>,
    ) -> ExtensionConnId {
        let seq = self.store().next_conn_seq();
        let id = ExtensionConnId::generate(seq);
        let entry = ExtensionEntry::new(id.clone(), seq, info, sink.clone());
        let stable_key = entry.stable_key.clone();
        let keepalive = entry.keepalive.clone();

        if let Some(replaced) = queries::find_extension_by_stable_key(&self.store().state(), &stable_key)
        {
            if let Some(old_sink) = replaced.sink.clone() {
                let old_id = replaced.id.clone();
                info!(target: "relay", old = %old_id.0, new = %id.0, key = %stable_key.0, "replacing extension connection");
                tokio::spawn(async move {
                    old_sink
                        .close(close::EXTENSION_REPLACED, "Extension Replaced")
                        .await;
                });
            }
        }

        self.store()
            .set_state(|state| Some(transitions::add_extension(state, entry)));

        let ping_sink = sink.clone();
        let ping_every = self.options().ping_interval;
        keepalive.set(tokio::spawn(async move {
            let mut ticker = interval(ping_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let frame = json!({ "method": "ping" }).to_string();
                if ping_sink.send_text(frame).await.is_err() {
                    break;
                }
            }
        }));

        info!(target: "relay", extension = %id.0, key = %stable_key.0, "extension connected");
        self.bus().publish(RelayEvent::ExtensionConnected {
            extension: id.clone(),
            stable_key,
        });
        id
    }

    /// Teardown for a closed extension socket, in the order the resources
    /// depend on each other: recording relay, keep-alive, pending requests,
    /// then one atomic state step that rebinds or strands the bound drivers.
    pub async fn unregister_extension(self: &Arc<Self>, id: &ExtensionConnId) {
        let state = self.store().state();
        let Some(entry) = state.extensions.get(id).cloned() else {
            return;
        };

        self.recording().shutdown(id).await;
        entry.keepalive.abort();
        for (_, responder) in entry.pending.drain() {
            let _ = responder.send(Err(RelayError::ExtensionClosed));
        }

        let successor = queries::find_extension_by_stable_key(&state, &entry.stable_key)
            .filter(|candidate| candidate.id != *id && candidate.sink.is_some())
            .map(|candidate| candidate.id.clone());

        match successor {
            Some(successor_id) => {
                self.store().set_state(|state| {
                    let next = transitions::rebind_clients_to_extension(state, id, &successor_id)
                        .unwrap_or_else(|| state.clone());
                    transitions::remove_extension(&next, id).or(Some(next))
                });
                info!(target: "relay", from = %id.0, to = %successor_id.0, "rebound clients to successor extension");
                self.bus().publish(RelayEvent::ClientsRebound {
                    from: id.clone(),
                    to: successor_id,
                });
            }
            None => {
                // Removing the clients in the same transition keeps the
                // binding invariant; the store subscriber closes their
                // sockets.
                self.store().set_state(|state| {
                    let next = transitions::remove_clients_for_extension(state, id)
                        .unwrap_or_else(|| state.clone());
                    transitions::remove_extension(&next, id).or(Some(next))
                });
            }
        }

        info!(target: "relay", extension = %id.0, "extension disconnected");
        self.bus()
            .publish(RelayEvent::ExtensionDisconnected { extension: id.clone() });
    }

    /// Dispatch one text frame from the extension socket.
    pub async fn on_extension_text(self: &Arc<Self>, id: &ExtensionConnId, text: &str) {
        let frame: ExtensionFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "relay", extension = %id.0, ?err, "malformed extension frame");
                let state = self.store().state();
                if let Some(sink) = state.extensions.get(id).and_then(|e| e.sink.clone()) {
                    sink.close(close::NORMAL, "Invalid JSON").await;
                }
                return;
            }
        };

        match frame {
            ExtensionFrame::Response { id: msg_id, result, error } => {
                let state = self.store().state();
                let Some(entry) = state.extensions.get(id) else {
                    return;
                };
                match entry.pending.remove(msg_id) {
                    Some(responder) => {
                        let outcome = match error {
                            Some(message) => Err(RelayError::Extension(message)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = responder.send(outcome);
                    }
                    None => {
                        debug!(target: "relay", extension = %id.0, msg_id, "response for unknown request id");
                    }
                }
            }
            ExtensionFrame::Notification { method, params } => {
                self.on_extension_notification(id, &method, params).await;
            }
        }
    }

    async fn on_extension_notification(
        self: &Arc<Self>,
        id: &ExtensionConnId,
        method: &str,
        params: Option<Value>,
    ) {
        match method {
            "pong" => {}
            "log" => forward_extension_log(id, params),
            "recordingData" => {
                self.recording()
                    .handle_frame(id, RecordingFrame::Data(params.unwrap_or(Value::Null)))
                    .await;
            }
            "recordingCancelled" => {
                self.recording()
                    .handle_frame(id, RecordingFrame::Cancelled(params.unwrap_or(Value::Null)))
                    .await;
            }
            "forwardCDPEvent" => {
                let payload: CdpEventPayload =
                    match serde_json::from_value(params.unwrap_or(Value::Null)) {
                        Ok(payload) => payload,
                        Err(err) => {
                            debug!(target: "relay", extension = %id.0, ?err, "unparseable forwarded event");
                            return;
                        }
                    };
                translator::handle_event(self, id, payload).await;
            }
            other => {
                debug!(target: "relay", extension = %id.0, method = other, "unknown extension notification");
            }
        }
    }

    /// Binary frames are recording payloads; the relay never inspects them.
    pub async fn on_extension_binary(self: &Arc<Self>, id: &ExtensionConnId, payload: Vec<u8>) {
        self.recording()
            .handle_frame(id, RecordingFrame::Binary(payload))
            .await;
    }

    /// Resolve an extension by selector (or fallback) and run one
    /// request/response round trip.
    pub async fn send_to_extension(
        self: &Arc<Self>,
        selector: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, RelayError> {
        let state = self.store().state();
        let entry = routing::resolve_extension(&state, selector, true)
            .ok_or(RelayError::ExtensionNotConnected)?;
        self.send_to_extension_entry(&entry, method, params).await
    }

    /// The outbound pipeline: allocate an id through the store, park a
    /// responder in the entry's pending map, write the frame, and race the
    /// response against the configured timeout. Every failure path removes
    /// the pending entry it created.
    pub(crate) async fn send_to_extension_entry(
        self: &Arc<Self>,
        entry: &ExtensionEntry,
        method: &str,
        params: Value,
    ) -> Result<Value, RelayError> {
        let sink = entry
            .sink
            .clone()
            .ok_or(RelayError::ExtensionNotConnected)?;
        let msg_id = self
            .store()
            .allocate_message_id(&entry.id)
            .ok_or(RelayError::ExtensionNotConnected)?;

        let (responder, response) = oneshot::channel();
        entry.pending.insert(msg_id, responder);

        let request = ExtensionRequest {
            id: msg_id,
            method: method.to_string(),
            params,
        };
        let text = serde_json::to_string(&request)
            .map_err(|err| RelayError::Internal(err.to_string()))?;
        trace!(target: "cdp_frames", extension = %entry.id.0, %text, "relay -> extension");
        if let Err(err) = sink.send_text(text).await {
            entry.pending.remove(msg_id);
            return Err(RelayError::SendFailed(err.to_string()));
        }

        let deadline = self.options().extension_request_timeout;
        match timeout(deadline, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::ExtensionClosed),
            Err(_) => {
                entry.pending.remove(msg_id);
                Err(RelayError::ExtensionTimeout {
                    timeout_ms: deadline.as_millis() as u64,
                    method: method.to_string(),
                })
            }
        }
    }

    /// Forward a CDP command verbatim to the tab behind `session_id`.
    pub(crate) async fn forward_cdp_command(
        self: &Arc<Self>,
        entry: &ExtensionEntry,
        session_id: Option<&CdpSessionId>,
        method: &str,
        params: Option<Value>,
        source: Option<&str>,
    ) -> Result<Value, RelayError> {
        let mut payload = json!({
            "method": method,
            "params": params.unwrap_or_else(|| json!({})),
        });
        if let Some(session) = session_id {
            payload["sessionId"] = json!(session.0);
        }
        if let Some(source) = source {
            payload["source"] = json!(source);
        }
        self.send_to_extension_entry(entry, "forwardCDPCommand", payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BrokenSink, ChannelSink};
    use crate::{Relay, RelayOptions};
    use relay_core_types::ClientId;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn options() -> RelayOptions {
        RelayOptions {
            extension_request_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_secs(600),
            ..RelayOptions::default()
        }
    }

    /// The keep-alive fires its first ping immediately on connect.
    async fn next_non_ping(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        loop {
            let frame = rx.recv().await.expect("frame");
            let value: Value = serde_json::from_str(&frame).expect("json frame");
            if value.get("method") != Some(&json!("ping")) {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn round_trip_resolves_and_clears_pending() {
        let relay = Relay::new(options());
        let (sink, mut rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink)
            .await;

        let relay_for_task = relay.clone();
        let ext_for_task = ext.clone();
        let request = tokio::spawn(async move {
            relay_for_task
                .send_to_extension(
                    Some(&ext_for_task.0),
                    "forwardCDPCommand",
                    json!({"method": "Page.reload", "params": {}}),
                )
                .await
        });

        let frame = next_non_ping(&mut rx).await;
        assert_eq!(frame["method"], json!("forwardCDPCommand"));
        let msg_id = frame["id"].as_u64().unwrap();
        relay
            .on_extension_text(&ext, &json!({"id": msg_id, "result": {"ok": true}}).to_string())
            .await;

        let result = request.await.unwrap().unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert!(relay.store().state().extensions[&ext].pending.is_empty());
    }

    #[tokio::test]
    async fn error_response_surfaces_extension_message() {
        let relay = Relay::new(options());
        let (sink, mut rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink)
            .await;

        let relay_for_task = relay.clone();
        let ext_for_task = ext.clone();
        let request = tokio::spawn(async move {
            relay_for_task
                .send_to_extension(Some(&ext_for_task.0), "createTab", json!({}))
                .await
        });

        let frame = next_non_ping(&mut rx).await;
        let msg_id = frame["id"].as_u64().unwrap();
        relay
            .on_extension_text(&ext, &json!({"id": msg_id, "error": "tab limit"}).to_string())
            .await;

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "tab limit");
    }

    #[tokio::test]
    async fn timeout_rejects_and_cleans_pending() {
        let relay = Relay::new(options());
        let (sink, _rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink)
            .await;

        let err = relay
            .send_to_extension(Some(&ext.0), "forwardCDPCommand", json!({}))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("timeout"), "got: {message}");
        assert!(message.contains("forwardCDPCommand"), "got: {message}");
        assert!(relay.store().state().extensions[&ext].pending.is_empty());
    }

    #[tokio::test]
    async fn send_failure_removes_pending_entry() {
        let relay = Relay::new(options());
        let ext = relay
            .register_extension(ExtensionInfo::default(), Arc::new(BrokenSink))
            .await;

        let err = relay
            .send_to_extension(Some(&ext.0), "forwardCDPCommand", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SendFailed(_)));
        assert!(relay.store().state().extensions[&ext].pending.is_empty());
    }

    #[tokio::test]
    async fn unregister_rejects_outstanding_requests() {
        let relay = Relay::new(options());
        let (sink, mut rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink)
            .await;

        let relay_for_task = relay.clone();
        let ext_for_task = ext.clone();
        let request = tokio::spawn(async move {
            relay_for_task
                .send_to_extension(Some(&ext_for_task.0), "forwardCDPCommand", json!({}))
                .await
        });
        let _ = next_non_ping(&mut rx).await;

        relay.unregister_extension(&ext).await;
        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Extension connection closed");
        assert!(relay.store().state().extensions.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_closes_the_socket() {
        let relay = Relay::new(options());
        let (sink, _rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink.clone())
            .await;

        relay.on_extension_text(&ext, "{not json").await;
        assert_eq!(
            sink.closed_with(),
            Some((close::NORMAL, "Invalid JSON".to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_response_id_is_ignored() {
        let relay = Relay::new(options());
        let (sink, _rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink.clone())
            .await;

        relay
            .on_extension_text(&ext, &json!({"id": 999, "result": {}}).to_string())
            .await;
        assert!(sink.closed_with().is_none());
    }

    #[tokio::test]
    async fn replacement_closes_predecessor_and_rebinds_drivers() {
        let relay = Relay::new(options());
        let info = ExtensionInfo {
            profile_id: Some("p1".into()),
            ..ExtensionInfo::default()
        };
        let (old_sink, _old_rx) = ChannelSink::new();
        let old = relay.register_extension(info.clone(), old_sink.clone()).await;

        let (driver_sink, _driver_rx) = ChannelSink::new();
        relay
            .register_client(ClientId("d1".into()), old.clone(), driver_sink.clone())
            .await
            .unwrap();

        let (new_sink, _new_rx) = ChannelSink::new();
        let new = relay.register_extension(info, new_sink).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            old_sink.closed_with(),
            Some((close::EXTENSION_REPLACED, "Extension Replaced".to_string()))
        );

        // Both entries share the stable key until the old close handler runs.
        assert_eq!(relay.store().state().extensions.len(), 2);

        relay.unregister_extension(&old).await;
        let state = relay.store().state();
        assert!(!state.extensions.contains_key(&old));
        let client = &state.playwright_clients[&ClientId("d1".into())];
        assert_eq!(client.extension_id, new);
        assert!(driver_sink.closed_with().is_none());
    }

    #[tokio::test]
    async fn last_extension_closing_strands_its_drivers() {
        let relay = Relay::new(options());
        let (sink, _rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink)
            .await;
        let (driver_sink, _driver_rx) = ChannelSink::new();
        relay
            .register_client(ClientId("d1".into()), ext.clone(), driver_sink.clone())
            .await
            .unwrap();

        relay.unregister_extension(&ext).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = relay.store().state();
        assert!(state.extensions.is_empty());
        assert!(state.playwright_clients.is_empty());
        assert!(driver_sink.closed_with().is_some());
    }

    #[tokio::test]
    async fn binary_frames_reach_the_recording_router() {
        use crate::collab::{RecordingFrame, RecordingRouter};
        use async_trait::async_trait;
        use parking_lot::Mutex;

        #[derive(Default)]
        struct CapturingRecorder {
            frames: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl RecordingRouter for CapturingRecorder {
            async fn handle_frame(&self, _extension: &ExtensionConnId, frame: RecordingFrame) {
                let label = match frame {
                    RecordingFrame::Data(_) => "data",
                    RecordingFrame::Cancelled(_) => "cancelled",
                    RecordingFrame::Binary(_) => "binary",
                };
                self.frames.lock().push(label.to_string());
            }

            async fn shutdown(&self, _extension: &ExtensionConnId) {
                self.frames.lock().push("shutdown".to_string());
            }
        }

        let recorder = Arc::new(CapturingRecorder::default());
        let relay = Relay::with_collaborators(
            options(),
            recorder.clone(),
            Arc::new(crate::NoopCliBridge),
        );
        let (sink, _rx) = ChannelSink::new();
        let ext = relay
            .register_extension(ExtensionInfo::default(), sink)
            .await;

        relay.on_extension_binary(&ext, vec![1, 2, 3]).await;
        relay
            .on_extension_text(&ext, &json!({"method": "recordingData", "params": {}}).to_string())
            .await;
        relay.unregister_extension(&ext).await;

        assert_eq!(
            recorder.frames.lock().as_slice(),
            &["binary".to_string(), "data".to_string(), "shutdown".to_string()]
        );
    }
}

fn forward_extension_log(id: &ExtensionConnId, params: Option<Value>) {
    let params = params.unwrap_or(Value::Null);
    let level = params
        .get("level")
        .and_then(Value::as_str)
        .unwrap_or("info");
    let message = params
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .map(|arg| match arg {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    match level {
        "error" => error!(target: "extension", extension = %id.0, "{message}"),
        "warn" => warn!(target: "extension", extension = %id.0, "{message}"),
        "debug" => debug!(target: "extension", extension = %id.0, "{message}"),
        _ => info!(target: "extension", extension = %id.0, "{message}"),
    }
}
