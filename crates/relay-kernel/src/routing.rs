//! Resolving which extension a driver request should land on.

use std::sync::Arc;

use relay_core_types::{ExtensionConnId, StableKey};
use relay_store::model::{ExtensionEntry, PlaywrightClient, RelayState};
use relay_store::queries;

/// Resolve an extension for a connecting driver.
///
/// A provided selector is tried as a connection id first, then as a stable
/// key (newest live match wins). Without a selector, fallback picks the only
/// live extension, or the only live one that actually has attached targets —
/// the "several profiles, one actively used" case.
pub fn resolve_extension(
    state: &RelayState,
    selector: Option<&str>,
    allow_fallback: bool,
) -> Option<Arc<ExtensionEntry>> {
    if let Some(selector) = selector {
        if let Some(entry) = state.extensions.get(&ExtensionConnId(selector.to_string())) {
            // Direct hits are honoured even while the socket is briefly
            // detached; stable-key lookups below cover the successor.
            return Some(entry.clone());
        }
        return queries::find_extension_by_stable_key(state, &StableKey(selector.to_string()))
            .filter(|entry| entry.sink.is_some())
            .cloned();
    }

    if !allow_fallback {
        return None;
    }

    let live: Vec<&Arc<ExtensionEntry>> = state
        .extensions
        .values()
        .filter(|entry| entry.sink.is_some())
        .collect();
    match live.len() {
        0 => None,
        1 => Some(live[0].clone()),
        _ => {
            let mut with_targets = live
                .iter()
                .filter(|entry| !entry.connected_targets.is_empty());
            match (with_targets.next(), with_targets.next()) {
                (Some(only), None) => Some((*only).clone()),
                _ => None,
            }
        }
    }
}

/// Resolve the extension a bound client should talk to right now.
///
/// Stable-key lookups always return the newest entry, so during a
/// replacement window commands from still-bound drivers flow to the
/// successor even before the predecessor's teardown has rebound them.
pub fn resolve_for_client(
    state: &RelayState,
    client: &PlaywrightClient,
) -> Option<Arc<ExtensionEntry>> {
    let entry = state.extensions.get(&client.extension_id)?;
    if let Some(newest) = queries::find_extension_by_stable_key(state, &entry.stable_key) {
        if newest.seq > entry.seq && newest.sink.is_some() {
            return Some(newest.clone());
        }
    }
    Some(entry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core_types::protocol::{ExtensionInfo, TargetInfo};
    use relay_core_types::{CdpSessionId, ClientId, RelayError, TargetId};
    use relay_store::model::{ConnectedTarget, MessageSink};
    use relay_store::{transitions, Store};
    use serde_json::Map;

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send_text(&self, _text: String) -> Result<(), RelayError> {
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {}
    }

    fn add_extension(store: &Store, id: &str, profile: Option<&str>) -> ExtensionConnId {
        let info = ExtensionInfo {
            profile_id: profile.map(|p| p.to_string()),
            ..ExtensionInfo::default()
        };
        let entry = ExtensionEntry::new(
            ExtensionConnId(id.to_string()),
            store.next_conn_seq(),
            info,
            Arc::new(NullSink),
        );
        let conn = entry.id.clone();
        store.set_state(|state| Some(transitions::add_extension(state, entry)));
        conn
    }

    fn add_target(store: &Store, ext: &ExtensionConnId, session: &str) {
        let info = TargetInfo {
            target_id: TargetId(format!("target-{session}")),
            kind: "page".into(),
            title: String::new(),
            url: "https://example.com".into(),
            attached: true,
            extra: Map::new(),
        };
        store.set_state(|state| {
            transitions::add_target(
                state,
                ext,
                ConnectedTarget::new(CdpSessionId(session.into()), info),
            )
        });
    }

    #[tokio::test]
    async fn selector_matches_connection_id_then_stable_key() {
        let store = Store::new();
        add_extension(&store, "ext-1", Some("p1"));
        let state = store.state();

        assert_eq!(
            resolve_extension(&state, Some("ext-1"), false).unwrap().id.0,
            "ext-1"
        );
        assert_eq!(
            resolve_extension(&state, Some("profile:p1"), false)
                .unwrap()
                .id
                .0,
            "ext-1"
        );
        assert!(resolve_extension(&state, Some("profile:none"), false).is_none());
    }

    #[tokio::test]
    async fn fallback_picks_single_live_extension() {
        let store = Store::new();
        add_extension(&store, "ext-1", None);
        let state = store.state();

        assert!(resolve_extension(&state, None, false).is_none());
        assert_eq!(
            resolve_extension(&state, None, true).unwrap().id.0,
            "ext-1"
        );
    }

    #[tokio::test]
    async fn fallback_prefers_the_extension_with_targets() {
        let store = Store::new();
        let busy = add_extension(&store, "ext-busy", Some("p1"));
        add_extension(&store, "ext-idle", Some("p2"));
        add_target(&store, &busy, "pw-tab-1");

        let state = store.state();
        assert_eq!(
            resolve_extension(&state, None, true).unwrap().id.0,
            "ext-busy"
        );

        // Two extensions with targets → ambiguous, no fallback.
        let idle = ExtensionConnId("ext-idle".into());
        add_target(&store, &idle, "pw-tab-2");
        let state = store.state();
        assert!(resolve_extension(&state, None, true).is_none());
    }

    #[tokio::test]
    async fn client_resolution_follows_stable_key_to_successor() {
        let store = Store::new();
        let old = add_extension(&store, "ext-old", Some("p1"));
        let new = add_extension(&store, "ext-new", Some("p1"));

        let client = PlaywrightClient {
            id: ClientId("d1".into()),
            extension_id: old.clone(),
            sink: Arc::new(NullSink),
        };
        let state = store.state();
        let resolved = resolve_for_client(&state, &client).unwrap();
        assert_eq!(resolved.id, new);
    }
}
