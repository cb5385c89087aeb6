//! Broadcast bus for relay observability events.
//!
//! Every CDP command, response, and extension-forwarded event rides the bus,
//! along with connection-lifecycle notifications. Subscribers are lossy:
//! a lagging receiver drops old events rather than back-pressuring the relay.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use relay_core_types::{CdpSessionId, ClientId, ExtensionConnId, StableKey};

#[derive(Clone, Debug)]
pub enum RelayEvent {
    /// A driver submitted a CDP command frame.
    CdpCommand {
        client: ClientId,
        method: String,
        frame: Value,
    },
    /// The relay answered a driver command (locally or via the extension).
    CdpResponse {
        client: ClientId,
        method: String,
        frame: Value,
    },
    /// The extension forwarded a CDP event from an attached tab.
    CdpEvent {
        extension: ExtensionConnId,
        method: String,
        session_id: Option<CdpSessionId>,
        params: Value,
    },
    ExtensionConnected {
        extension: ExtensionConnId,
        stable_key: StableKey,
    },
    ExtensionDisconnected {
        extension: ExtensionConnId,
    },
    ClientConnected {
        client: ClientId,
    },
    ClientDisconnected {
        client: ClientId,
    },
    /// Drivers were inherited by a successor extension with the same stable key.
    ClientsRebound {
        from: ExtensionConnId,
        to: ExtensionConnId,
    },
}

pub struct RelayBus {
    sender: broadcast::Sender<RelayEvent>,
}

impl RelayBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    /// Publish never blocks and never fails; an event with no subscribers is
    /// simply dropped.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}
