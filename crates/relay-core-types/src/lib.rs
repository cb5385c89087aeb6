//! Shared identifiers, error types, and wire-protocol structures for the
//! CDP relay. Everything here is plain data; the behavioural crates
//! (`relay-store`, `relay-kernel`, `relay-server`) build on these types.

pub mod protocol;

pub mod ids {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Process-unique identifier for one extension WebSocket connection.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct ExtensionConnId(pub String);

    impl ExtensionConnId {
        /// Connection ids combine a monotonic sequence with a random tail so
        /// they stay unique across rapid reconnects within one process.
        pub fn generate(seq: u64) -> Self {
            let tail = Uuid::new_v4().simple().to_string();
            Self(format!("ext-{}-{}", seq, &tail[..8]))
        }
    }

    /// Identifier for a connected driver (Playwright-family client).
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct ClientId(pub String);

    impl ClientId {
        pub fn generate() -> Self {
            Self(Uuid::new_v4().to_string())
        }
    }

    /// CDP session id assigned by the extension (e.g. `pw-tab-3`).
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct CdpSessionId(pub String);

    /// CDP target id reported by the extension's debugger API.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct TargetId(pub String);

    /// CDP frame id.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct FrameId(pub String);

    /// Synthetic identity for an extension connection so a reconnecting
    /// extension from the same browser profile can inherit drivers bound to
    /// its predecessor.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct StableKey(pub String);

    impl StableKey {
        /// Derivation priority: profile id, then email, then browser name,
        /// then the connection id itself.
        pub fn derive(info: &crate::protocol::ExtensionInfo, conn: &ExtensionConnId) -> Self {
            if let Some(profile) = info.profile_id.as_deref().filter(|v| !v.is_empty()) {
                return Self(format!("profile:{profile}"));
            }
            if let Some(email) = info.email.as_deref().filter(|v| !v.is_empty()) {
                return Self(format!("email:{email}"));
            }
            if let Some(browser) = info.browser.as_deref().filter(|v| !v.is_empty()) {
                return Self(format!("browser:{browser}"));
            }
            Self(format!("connection:{}", conn.0))
        }
    }
}

pub mod error {
    use thiserror::Error;

    /// Error surface shared by the relay crates. Display strings double as
    /// the driver-visible `error.message` payloads, so their wording is part
    /// of the wire contract.
    #[derive(Clone, Debug, Error)]
    pub enum RelayError {
        #[error("Extension not connected")]
        ExtensionNotConnected,
        #[error("Extension request timeout after {timeout_ms}ms: {method}")]
        ExtensionTimeout { timeout_ms: u64, method: String },
        #[error("Extension connection closed")]
        ExtensionClosed,
        #[error("No target with id {0}")]
        TargetNotFound(String),
        #[error("Duplicate client id: {0}")]
        DuplicateClient(String),
        #[error("{0}")]
        Extension(String),
        #[error("send failed: {0}")]
        SendFailed(String),
        #[error("unauthorized: {0}")]
        Unauthorized(String),
        #[error("internal error: {0}")]
        Internal(String),
    }
}

/// WebSocket close codes used by the relay.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const EXTENSION_REPLACED: u16 = 4001;
    pub const NO_EXTENSION: u16 = 4003;
    pub const DUPLICATE_CLIENT: u16 = 4004;
}

pub use error::RelayError;
pub use ids::{CdpSessionId, ClientId, ExtensionConnId, FrameId, StableKey, TargetId};

#[cfg(test)]
mod tests {
    use super::ids::{ExtensionConnId, StableKey};
    use super::protocol::ExtensionInfo;

    #[test]
    fn stable_key_prefers_profile_over_email_and_browser() {
        let conn = ExtensionConnId("ext-1-abc".into());
        let mut info = ExtensionInfo {
            browser: Some("chrome".into()),
            email: Some("user@example.com".into()),
            profile_id: Some("p1".into()),
            version: None,
        };
        assert_eq!(StableKey::derive(&info, &conn).0, "profile:p1");

        info.profile_id = None;
        assert_eq!(StableKey::derive(&info, &conn).0, "email:user@example.com");

        info.email = None;
        assert_eq!(StableKey::derive(&info, &conn).0, "browser:chrome");

        info.browser = None;
        assert_eq!(StableKey::derive(&info, &conn).0, "connection:ext-1-abc");
    }

    #[test]
    fn stable_key_skips_empty_fields() {
        let conn = ExtensionConnId("ext-2-def".into());
        let info = ExtensionInfo {
            browser: Some("edge".into()),
            email: Some(String::new()),
            profile_id: Some(String::new()),
            version: None,
        };
        assert_eq!(StableKey::derive(&info, &conn).0, "browser:edge");
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ExtensionConnId::generate(1);
        let b = ExtensionConnId::generate(1);
        assert_ne!(a, b);
        assert!(a.0.starts_with("ext-1-"));
    }
}
