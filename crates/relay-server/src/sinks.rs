//! [`MessageSink`] over the write half of an axum WebSocket.

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;
use tracing::debug;

use relay_core_types::RelayError;
use relay_store::model::MessageSink;

pub struct WsSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|err| RelayError::SendFailed(err.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        }));
        if let Err(err) = self.sender.lock().await.send(frame).await {
            debug!(target: "relay-server", ?err, code, "close frame not delivered");
        }
    }
}
