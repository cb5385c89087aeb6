//! Read-only derivations over [`RelayState`].

use std::sync::Arc;

use relay_core_types::{CdpSessionId, ExtensionConnId, FrameId, StableKey};

use crate::model::{ConnectedTarget, ExtensionEntry, PlaywrightClient, RelayState};

/// Newest entry holding the key wins: during reconnect overlap two entries
/// briefly share a stable key and the successor is authoritative.
pub fn find_extension_by_stable_key<'a>(
    state: &'a RelayState,
    key: &StableKey,
) -> Option<&'a Arc<ExtensionEntry>> {
    state
        .extensions
        .values()
        .filter(|entry| entry.stable_key == *key)
        .max_by_key(|entry| entry.seq)
}

/// Which extension owns a given CDP session id.
pub fn find_extension_id_by_cdp_session(
    state: &RelayState,
    session_id: &CdpSessionId,
) -> Option<ExtensionConnId> {
    state
        .extensions
        .values()
        .find(|entry| entry.connected_targets.contains_key(session_id))
        .map(|entry| entry.id.clone())
}

/// The target whose `frame_ids` set currently holds the frame.
pub fn find_target_by_frame<'a>(
    entry: &'a ExtensionEntry,
    frame_id: &FrameId,
) -> Option<&'a ConnectedTarget> {
    entry
        .connected_targets
        .values()
        .find(|target| target.frame_ids.contains(frame_id))
}

pub fn clients_for_extension(
    state: &RelayState,
    extension: &ExtensionConnId,
) -> Vec<Arc<PlaywrightClient>> {
    state
        .playwright_clients
        .values()
        .filter(|client| client.extension_id == *extension)
        .cloned()
        .collect()
}
