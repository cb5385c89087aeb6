//! Seams to the out-of-scope collaborators. The relay only routes traffic to
//! them; their behaviour lives elsewhere. No-op implementations keep the
//! relay self-contained in tests and minimal deployments.

use async_trait::async_trait;
use serde_json::Value;

use relay_core_types::{ExtensionConnId, RelayError};

/// A recording payload travelling over the extension socket.
#[derive(Debug)]
pub enum RecordingFrame {
    Data(Value),
    Cancelled(Value),
    Binary(Vec<u8>),
}

/// Receives recording traffic for an extension and serves the privileged
/// `/recording/*` HTTP routes.
#[async_trait]
pub trait RecordingRouter: Send + Sync {
    async fn handle_frame(&self, extension: &ExtensionConnId, frame: RecordingFrame);

    /// Invoked when the extension connection closes so any in-flight relay
    /// can be cancelled.
    async fn shutdown(&self, extension: &ExtensionConnId);

    async fn handle_http(&self, path: &str, body: Value) -> Result<Value, RelayError> {
        let _ = (path, body);
        Err(RelayError::Internal("recording router not configured".into()))
    }
}

pub struct NoopRecording;

#[async_trait]
impl RecordingRouter for NoopRecording {
    async fn handle_frame(&self, _extension: &ExtensionConnId, _frame: RecordingFrame) {}

    async fn shutdown(&self, _extension: &ExtensionConnId) {}
}

/// Serves the privileged `/cli/*` HTTP routes.
#[async_trait]
pub trait CliBridge: Send + Sync {
    async fn handle(&self, path: &str, body: Value) -> Result<Value, RelayError>;
}

pub struct NoopCliBridge;

#[async_trait]
impl CliBridge for NoopCliBridge {
    async fn handle(&self, _path: &str, _body: Value) -> Result<Value, RelayError> {
        Err(RelayError::Internal("cli bridge not configured".into()))
    }
}
