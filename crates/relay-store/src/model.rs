//! State-atom entities. Entries are immutable: transitions rebuild them and
//! swap the owning `Arc`, so an untouched entry keeps pointer identity across
//! transitions. Runtime resources (sinks, pending requests, keep-alive tasks)
//! sit behind their own `Arc`s and survive entry rebuilds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use relay_core_types::protocol::{ExtensionInfo, TargetInfo};
use relay_core_types::{
    CdpSessionId, ClientId, ExtensionConnId, FrameId, RelayError, StableKey, TargetId,
};

/// Write half of a WebSocket, abstracted so the store and kernel never touch
/// the HTTP layer. Implemented over axum sockets in `relay-server` and over
/// channels in tests.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), RelayError>;
    async fn close(&self, code: u16, reason: &str);
}

type Responder = oneshot::Sender<Result<Value, RelayError>>;

/// Outstanding relay→extension requests awaiting a response frame, keyed by
/// message id. Shared across entry rebuilds so in-flight requests stay
/// resolvable while the entry is replaced in state.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, Responder>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: u64, responder: Responder) {
        self.inner.lock().insert(id, responder);
    }

    pub fn remove(&self, id: u64) -> Option<Responder> {
        self.inner.lock().remove(&id)
    }

    /// Take every outstanding responder, leaving the map empty.
    pub fn drain(&self) -> Vec<(u64, Responder)> {
        self.inner.lock().drain().collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Handle to the per-extension keep-alive task.
#[derive(Default)]
pub struct KeepaliveHandle {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeepaliveHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install a new task, aborting any previous one.
    pub fn set(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// One attached tab or OOPIF session owned by an extension.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectedTarget {
    pub session_id: CdpSessionId,
    pub target_id: TargetId,
    pub target_info: TargetInfo,
    /// Frame ids currently associated with this session, populated by
    /// `Page.frameAttached`/`frameNavigated`. Disjoint across targets of the
    /// same extension.
    pub frame_ids: HashSet<FrameId>,
}

impl ConnectedTarget {
    pub fn new(session_id: CdpSessionId, target_info: TargetInfo) -> Self {
        Self {
            session_id,
            target_id: target_info.target_id.clone(),
            target_info,
            frame_ids: HashSet::new(),
        }
    }
}

/// One live extension WebSocket.
#[derive(Clone)]
pub struct ExtensionEntry {
    pub id: ExtensionConnId,
    /// Monotonic insertion sequence; the highest `seq` wins stable-key lookups.
    pub seq: u64,
    pub stable_key: StableKey,
    pub info: ExtensionInfo,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub connected_targets: HashMap<CdpSessionId, ConnectedTarget>,
    /// None once the socket is detached while the entry briefly lingers.
    pub sink: Option<Arc<dyn MessageSink>>,
    /// Next outbound message id; advanced only through a store transition.
    pub next_message_id: u64,
    pub pending: Arc<PendingRequests>,
    pub keepalive: Arc<KeepaliveHandle>,
}

impl ExtensionEntry {
    pub fn new(
        id: ExtensionConnId,
        seq: u64,
        info: ExtensionInfo,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let stable_key = StableKey::derive(&info, &id);
        Self {
            id,
            seq,
            stable_key,
            info,
            connected_at: chrono::Utc::now(),
            connected_targets: HashMap::new(),
            sink: Some(sink),
            next_message_id: 1,
            pending: PendingRequests::new(),
            keepalive: KeepaliveHandle::new(),
        }
    }
}

/// One connected driver, bound to its owning extension by id only.
#[derive(Clone)]
pub struct PlaywrightClient {
    pub id: ClientId,
    pub extension_id: ExtensionConnId,
    pub sink: Arc<dyn MessageSink>,
}

/// The single state atom.
#[derive(Clone, Default)]
pub struct RelayState {
    pub extensions: HashMap<ExtensionConnId, Arc<ExtensionEntry>>,
    pub playwright_clients: HashMap<ClientId, Arc<PlaywrightClient>>,
}
