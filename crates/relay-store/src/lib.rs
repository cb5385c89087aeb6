//! The relay's single source of truth.
//!
//! All connection, target, and client bookkeeping lives in one immutable
//! [`RelayState`] atom. Mutation happens exclusively through
//! [`Store::set_state`] with a pure transition; subscribers observe every
//! change synchronously as a `(next, previous)` snapshot pair and derive
//! side-effects from state shape, not from the event that caused the change.

pub mod model;
pub mod queries;
pub mod transitions;

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use model::{
    ConnectedTarget, ExtensionEntry, KeepaliveHandle, MessageSink, PendingRequests,
    PlaywrightClient, RelayState,
};

use relay_core_types::ExtensionConnId;

type Subscriber = Box<dyn Fn(&Arc<RelayState>, &Arc<RelayState>) + Send + Sync>;

pub struct Store {
    state: RwLock<Arc<RelayState>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Serializes transition + notification so subscribers always observe
    /// state pairs in commit order.
    commit: Mutex<()>,
    conn_seq: AtomicU64,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(Arc::new(RelayState::default())),
            subscribers: Mutex::new(Vec::new()),
            commit: Mutex::new(()),
            conn_seq: AtomicU64::new(1),
        })
    }

    /// Snapshot of the current state; the same references are returned until
    /// the next transition commits.
    pub fn state(&self) -> Arc<RelayState> {
        self.state.read().clone()
    }

    /// Monotonic sequence for extension connection ids and entry ordering.
    pub fn next_conn_seq(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply a pure transition. `None` means the precondition failed and the
    /// previous state reference is kept; subscribers are not notified.
    /// Subscribers must not call back into `set_state`.
    pub fn set_state<F>(&self, transition: F) -> Arc<RelayState>
    where
        F: FnOnce(&RelayState) -> Option<RelayState>,
    {
        let _commit = self.commit.lock();
        let previous = self.state.read().clone();
        let Some(next) = transition(&previous) else {
            return previous;
        };
        let next = Arc::new(next);
        *self.state.write() = next.clone();
        for subscriber in self.subscribers.lock().iter() {
            subscriber(&next, &previous);
        }
        next
    }

    /// Listener fires synchronously after every committed transition.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Arc<RelayState>, &Arc<RelayState>) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(listener));
    }

    /// Allocate the next outbound message id for an extension, advancing the
    /// counter atomically with respect to other transitions.
    pub fn allocate_message_id(&self, extension: &ExtensionConnId) -> Option<u64> {
        let allocated = Cell::new(None);
        self.set_state(|state| {
            let (next, id) = transitions::increment_message_id(state, extension)?;
            allocated.set(Some(id));
            Some(next)
        });
        allocated.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core_types::protocol::{ExtensionInfo, TargetInfo};
    use relay_core_types::{CdpSessionId, ClientId, FrameId, RelayError, TargetId};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send_text(&self, _text: String) -> Result<(), RelayError> {
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {}
    }

    fn entry(store: &Store, id: &str) -> ExtensionEntry {
        ExtensionEntry::new(
            ExtensionConnId(id.to_string()),
            store.next_conn_seq(),
            ExtensionInfo::default(),
            Arc::new(NullSink),
        )
    }

    fn target_info(target_id: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: TargetId(target_id.into()),
            kind: "page".into(),
            title: String::new(),
            url: url.into(),
            attached: true,
            extra: Map::new(),
        }
    }

    fn add_target(store: &Store, ext: &str, session: &str, target_id: &str) {
        store.set_state(|state| {
            transitions::add_target(
                state,
                &ExtensionConnId(ext.into()),
                ConnectedTarget::new(
                    CdpSessionId(session.into()),
                    target_info(target_id, "https://example.com"),
                ),
            )
        });
    }

    #[tokio::test]
    async fn unmodified_entries_keep_pointer_identity() {
        let store = Store::new();
        let a = entry(&store, "ext-a");
        let b = entry(&store, "ext-b");
        store.set_state(|state| Some(transitions::add_extension(state, a)));
        store.set_state(|state| Some(transitions::add_extension(state, b)));

        let before = store.state();
        add_target(&store, "ext-b", "pw-tab-1", "T1");
        let after = store.state();

        let key_a = ExtensionConnId("ext-a".into());
        let key_b = ExtensionConnId("ext-b".into());
        assert!(Arc::ptr_eq(
            &before.extensions[&key_a],
            &after.extensions[&key_a]
        ));
        assert!(!Arc::ptr_eq(
            &before.extensions[&key_b],
            &after.extensions[&key_b]
        ));
    }

    #[tokio::test]
    async fn add_then_remove_extension_restores_empty_state() {
        let store = Store::new();
        let e = entry(&store, "ext-a");
        store.set_state(|state| Some(transitions::add_extension(state, e)));
        store.set_state(|state| {
            transitions::remove_extension(state, &ExtensionConnId("ext-a".into()))
        });

        let state = store.state();
        assert!(state.extensions.is_empty());
        assert!(state.playwright_clients.is_empty());
    }

    #[tokio::test]
    async fn noop_transition_keeps_state_reference_and_skips_subscribers() {
        let store = Store::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_listener = fired.clone();
        store.subscribe(move |_, _| {
            fired_in_listener.fetch_add(1, Ordering::SeqCst);
        });

        let before = store.state();
        let after = store.set_state(|state| {
            transitions::remove_extension(state, &ExtensionConnId("missing".into()))
        });

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn add_target_preserves_existing_frame_ids() {
        let store = Store::new();
        let e = entry(&store, "ext-a");
        store.set_state(|state| Some(transitions::add_extension(state, e)));
        add_target(&store, "ext-a", "pw-tab-1", "T1");
        store.set_state(|state| {
            transitions::add_frame_id(
                state,
                &ExtensionConnId("ext-a".into()),
                &CdpSessionId("pw-tab-1".into()),
                FrameId("F1".into()),
            )
        });

        // Re-attach with fresh target info; the frame set must survive.
        add_target(&store, "ext-a", "pw-tab-1", "T1");

        let state = store.state();
        let entry = &state.extensions[&ExtensionConnId("ext-a".into())];
        let target = &entry.connected_targets[&CdpSessionId("pw-tab-1".into())];
        assert!(target.frame_ids.contains(&FrameId("F1".into())));
    }

    #[tokio::test]
    async fn frame_ids_stay_disjoint_when_a_frame_moves() {
        let store = Store::new();
        let e = entry(&store, "ext-a");
        store.set_state(|state| Some(transitions::add_extension(state, e)));
        add_target(&store, "ext-a", "pw-tab-1", "T1");
        add_target(&store, "ext-a", "pw-tab-2", "T2");

        let ext = ExtensionConnId("ext-a".into());
        let frame = FrameId("F1".into());
        store.set_state(|state| {
            transitions::add_frame_id(state, &ext, &CdpSessionId("pw-tab-1".into()), frame.clone())
        });
        store.set_state(|state| {
            transitions::add_frame_id(state, &ext, &CdpSessionId("pw-tab-2".into()), frame.clone())
        });

        let state = store.state();
        let entry = &state.extensions[&ext];
        assert!(transitions::frame_ids_disjoint(entry));
        assert!(!entry.connected_targets[&CdpSessionId("pw-tab-1".into())]
            .frame_ids
            .contains(&frame));
        assert!(entry.connected_targets[&CdpSessionId("pw-tab-2".into())]
            .frame_ids
            .contains(&frame));
    }

    #[tokio::test]
    async fn repeated_target_info_update_is_fixed_after_first() {
        let store = Store::new();
        let e = entry(&store, "ext-a");
        store.set_state(|state| Some(transitions::add_extension(state, e)));
        add_target(&store, "ext-a", "pw-tab-1", "T1");

        let ext = ExtensionConnId("ext-a".into());
        let info = target_info("T1", "https://changed.example");
        store.set_state(|state| transitions::update_target_info(state, &ext, info.clone()));
        let first = store.state();
        store.set_state(|state| transitions::update_target_info(state, &ext, info.clone()));
        let second = store.state();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn stable_key_lookup_returns_newest_entry() {
        let store = Store::new();
        let info = ExtensionInfo {
            profile_id: Some("p1".into()),
            ..ExtensionInfo::default()
        };
        let older = ExtensionEntry::new(
            ExtensionConnId("ext-old".into()),
            store.next_conn_seq(),
            info.clone(),
            Arc::new(NullSink),
        );
        let newer = ExtensionEntry::new(
            ExtensionConnId("ext-new".into()),
            store.next_conn_seq(),
            info,
            Arc::new(NullSink),
        );
        let key = older.stable_key.clone();
        store.set_state(|state| Some(transitions::add_extension(state, older)));
        store.set_state(|state| Some(transitions::add_extension(state, newer)));

        let state = store.state();
        let found = queries::find_extension_by_stable_key(&state, &key).unwrap();
        assert_eq!(found.id.0, "ext-new");
    }

    #[tokio::test]
    async fn rebind_moves_clients_between_extensions() {
        let store = Store::new();
        let e1 = entry(&store, "ext-a");
        let e2 = entry(&store, "ext-b");
        store.set_state(|state| Some(transitions::add_extension(state, e1)));
        store.set_state(|state| Some(transitions::add_extension(state, e2)));
        store.set_state(|state| {
            Some(transitions::add_playwright_client(
                state,
                PlaywrightClient {
                    id: ClientId("d1".into()),
                    extension_id: ExtensionConnId("ext-a".into()),
                    sink: Arc::new(NullSink),
                },
            ))
        });

        store.set_state(|state| {
            let rebound = transitions::rebind_clients_to_extension(
                state,
                &ExtensionConnId("ext-a".into()),
                &ExtensionConnId("ext-b".into()),
            )?;
            transitions::remove_extension(&rebound, &ExtensionConnId("ext-a".into()))
        });

        let state = store.state();
        assert!(!state.extensions.contains_key(&ExtensionConnId("ext-a".into())));
        let client = &state.playwright_clients[&ClientId("d1".into())];
        assert_eq!(client.extension_id.0, "ext-b");
    }

    #[tokio::test]
    async fn subscriber_sees_removed_clients_in_previous_snapshot() {
        let store = Store::new();
        let e = entry(&store, "ext-a");
        store.set_state(|state| Some(transitions::add_extension(state, e)));
        store.set_state(|state| {
            Some(transitions::add_playwright_client(
                state,
                PlaywrightClient {
                    id: ClientId("d1".into()),
                    extension_id: ExtensionConnId("ext-a".into()),
                    sink: Arc::new(NullSink),
                },
            ))
        });

        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_in_listener = observed.clone();
        store.subscribe(move |next, previous| {
            for id in previous.playwright_clients.keys() {
                if !next.playwright_clients.contains_key(id) {
                    observed_in_listener.lock().push(id.clone());
                }
            }
        });

        store.set_state(|state| {
            let cleared =
                transitions::remove_clients_for_extension(state, &ExtensionConnId("ext-a".into()))?;
            transitions::remove_extension(&cleared, &ExtensionConnId("ext-a".into()))
        });

        assert_eq!(observed.lock().as_slice(), &[ClientId("d1".into())]);
    }

    #[tokio::test]
    async fn cdp_session_lookup_finds_the_owning_extension() {
        let store = Store::new();
        let a = entry(&store, "ext-a");
        let b = entry(&store, "ext-b");
        store.set_state(|state| Some(transitions::add_extension(state, a)));
        store.set_state(|state| Some(transitions::add_extension(state, b)));
        add_target(&store, "ext-b", "pw-tab-7", "T7");

        let state = store.state();
        let owner =
            queries::find_extension_id_by_cdp_session(&state, &CdpSessionId("pw-tab-7".into()));
        assert_eq!(owner, Some(ExtensionConnId("ext-b".into())));
        assert_eq!(
            queries::find_extension_id_by_cdp_session(&state, &CdpSessionId("missing".into())),
            None
        );
    }

    #[tokio::test]
    async fn message_ids_are_sequential_per_extension() {
        let store = Store::new();
        let e = entry(&store, "ext-a");
        store.set_state(|state| Some(transitions::add_extension(state, e)));

        let ext = ExtensionConnId("ext-a".into());
        assert_eq!(store.allocate_message_id(&ext), Some(1));
        assert_eq!(store.allocate_message_id(&ext), Some(2));
        assert_eq!(store.allocate_message_id(&ExtensionConnId("nope".into())), None);
    }
}
