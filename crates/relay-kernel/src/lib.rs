//! The relay brain: per-connection session logic, the CDP emulator, and the
//! event translator, all driving the shared state atom.
//!
//! The HTTP/WebSocket surface lives in `relay-server`; this crate only sees
//! [`MessageSink`]s, which keeps every flow testable with in-memory stubs.

pub mod collab;
pub mod config;
pub mod driver;
pub mod emulator;
pub mod extension;
pub mod routing;
#[cfg(test)]
pub(crate) mod test_support;
pub mod translator;

use std::sync::Arc;

use relay_event_bus::RelayBus;
use relay_store::{MessageSink, Store};
use tracing::debug;

pub use collab::{CliBridge, NoopCliBridge, NoopRecording, RecordingFrame, RecordingRouter};
pub use config::RelayOptions;

pub struct Relay {
    store: Arc<Store>,
    bus: Arc<RelayBus>,
    options: RelayOptions,
    recording: Arc<dyn RecordingRouter>,
    cli: Arc<dyn CliBridge>,
}

impl Relay {
    pub fn new(options: RelayOptions) -> Arc<Self> {
        Self::with_collaborators(options, Arc::new(NoopRecording), Arc::new(NoopCliBridge))
    }

    pub fn with_collaborators(
        options: RelayOptions,
        recording: Arc<dyn RecordingRouter>,
        cli: Arc<dyn CliBridge>,
    ) -> Arc<Self> {
        let store = Store::new();
        let bus = RelayBus::new(256);

        // Reactive cleanup is a function of state shape: any client that
        // disappears from the atom gets its socket closed. The rebind path
        // never removes clients, so only genuinely orphaned drivers match.
        store.subscribe(|next, previous| {
            for (id, client) in previous.playwright_clients.iter() {
                if next.playwright_clients.contains_key(id) {
                    continue;
                }
                let sink = client.sink.clone();
                let client_id = id.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        sink.close(relay_core_types::close::NORMAL, "Extension disconnected")
                            .await;
                    });
                } else {
                    debug!(target: "relay", client = %client_id.0, "no runtime to close orphaned client");
                }
            }
        });

        Arc::new(Self {
            store,
            bus,
            options,
            recording,
            cli,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<RelayBus> {
        &self.bus
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn recording(&self) -> &Arc<dyn RecordingRouter> {
        &self.recording
    }

    pub fn cli(&self) -> &Arc<dyn CliBridge> {
        &self.cli
    }
}

/// Serialize a frame and write it through a sink, logging and swallowing
/// failures: a peer may legitimately disconnect while a frame is in flight.
pub(crate) async fn send_json<T: serde::Serialize>(
    sink: &Arc<dyn MessageSink>,
    frame: &T,
    context: &str,
) {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            debug!(target: "relay", ?err, context, "failed to serialize outbound frame");
            return;
        }
    };
    if let Err(err) = sink.send_text(text).await {
        debug!(target: "relay", %err, context, "send after close");
    }
}
