//! In-memory sinks used by the unit tests, in place of real sockets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relay_core_types::RelayError;
use relay_store::model::MessageSink;

/// Sink that records every outbound frame on a channel and remembers the
/// close it received.
pub(crate) struct ChannelSink {
    frames: mpsc::UnboundedSender<String>,
    closed: Mutex<Option<(u16, String)>>,
}

impl ChannelSink {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                frames,
                closed: Mutex::new(None),
            }),
            rx,
        )
    }

    pub(crate) fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.frames
            .send(text)
            .map_err(|err| RelayError::SendFailed(err.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        *self.closed.lock() = Some((code, reason.to_string()));
    }
}

/// Sink whose sends always fail, for exercising send-failure cleanup.
pub(crate) struct BrokenSink;

#[async_trait]
impl MessageSink for BrokenSink {
    async fn send_text(&self, _text: String) -> Result<(), RelayError> {
        Err(RelayError::SendFailed("sink broken".into()))
    }

    async fn close(&self, _code: u16, _reason: &str) {}
}
