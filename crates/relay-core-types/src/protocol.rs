//! Wire-protocol envelopes for the two WebSocket surfaces.
//!
//! The driver speaks plain CDP frames on `/cdp`; the extension speaks a
//! small request/response + notification protocol on `/extension`. Payloads
//! for non-emulated CDP methods stay opaque `serde_json::Value`s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CdpSessionId, TargetId};

/// Metadata the extension supplies at upgrade time via query parameters
/// (`browser`, `email`, `id`, `v`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub browser: Option<String>,
    pub email: Option<String>,
    pub profile_id: Option<String>,
    pub version: Option<String>,
}

/// Last-known CDP `Target.TargetInfo` for an attached target. Fields the
/// relay inspects are named; everything else rides along in `extra` so
/// forwarded payloads round-trip untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Restricted targets never reach a driver: anything that is not a page or
/// iframe, or whose URL lives on a browser-internal scheme, or a
/// chrome-extension page outside the allow-list.
pub fn is_restricted_target(info: &TargetInfo, allowed_extension_ids: &[String]) -> bool {
    if info.kind != "page" && info.kind != "iframe" {
        return true;
    }
    let url = info.url.as_str();
    if url.starts_with("chrome://") || url.starts_with("devtools://") || url.starts_with("edge://")
    {
        return true;
    }
    if let Some(rest) = url.strip_prefix("chrome-extension://") {
        let id = rest.split('/').next().unwrap_or("");
        return !allowed_extension_ids.iter().any(|allowed| allowed == id);
    }
    false
}

/// One CDP command frame from the driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverCommand {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<CdpSessionId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// CDP error object carried inside an error response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdpErrorObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
}

/// One CDP response frame to the driver; exactly one per command id.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<CdpSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpErrorObject>,
}

impl DriverResponse {
    pub fn ok(id: u64, session_id: Option<CdpSessionId>, result: Value) -> Self {
        Self {
            id,
            session_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, session_id: Option<CdpSessionId>, message: impl Into<String>) -> Self {
        Self {
            id,
            session_id,
            result: None,
            error: Some(CdpErrorObject {
                code: None,
                message: message.into(),
            }),
        }
    }
}

/// One CDP event frame to the driver. `server_generated` marks events the
/// relay synthesized (attach replay, discovery replay) for observability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverEvent {
    pub method: String,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<CdpSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(
        rename = "__serverGenerated",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_generated: Option<bool>,
}

/// A CDP event the extension forwarded from an attached tab
/// (`method: "forwardCDPEvent"` payload).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpEventPayload {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<CdpSessionId>,
    #[serde(default)]
    pub params: Value,
}

/// Text frame arriving from the extension: either a response to a relay
/// request (has `id`) or a notification (has `method`).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ExtensionFrame {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Notification {
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
}

/// Request frame from the relay to the extension. Ids are allocated from the
/// owning extension entry's monotonic counter.
#[derive(Clone, Debug, Serialize)]
pub struct ExtensionRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}
