//! Pure transition functions over [`RelayState`].
//!
//! Every function is data-only: no I/O, no clock, no channel sends. A
//! transition whose precondition fails returns `None`, which the store
//! interprets as "keep the previous state reference". Compose transitions by
//! chaining inside a single `set_state` call when the result must be atomic.

use std::collections::HashSet;
use std::sync::Arc;

use relay_core_types::protocol::TargetInfo;
use relay_core_types::{CdpSessionId, ClientId, ExtensionConnId, FrameId, TargetId};

use crate::model::{ConnectedTarget, ExtensionEntry, MessageSink, PlaywrightClient, RelayState};

pub fn add_extension(state: &RelayState, entry: ExtensionEntry) -> RelayState {
    let mut next = state.clone();
    next.extensions.insert(entry.id.clone(), Arc::new(entry));
    next
}

pub fn remove_extension(state: &RelayState, id: &ExtensionConnId) -> Option<RelayState> {
    if !state.extensions.contains_key(id) {
        return None;
    }
    let mut next = state.clone();
    next.extensions.remove(id);
    Some(next)
}

/// Point every client bound to `from` at `to` instead. Part of the atomic
/// replacement step: compose with [`remove_extension`] in one `set_state`.
pub fn rebind_clients_to_extension(
    state: &RelayState,
    from: &ExtensionConnId,
    to: &ExtensionConnId,
) -> Option<RelayState> {
    if !state.extensions.contains_key(to) {
        return None;
    }
    let mut next = state.clone();
    let mut changed = false;
    for client in next.playwright_clients.values_mut() {
        if client.extension_id == *from {
            let mut rebound = (**client).clone();
            rebound.extension_id = to.clone();
            *client = Arc::new(rebound);
            changed = true;
        }
    }
    changed.then_some(next)
}

pub fn update_extension_sink(
    state: &RelayState,
    id: &ExtensionConnId,
    sink: Option<Arc<dyn MessageSink>>,
) -> Option<RelayState> {
    let entry = state.extensions.get(id)?;
    let mut updated = (**entry).clone();
    updated.sink = sink;
    Some(replace_entry(state, updated))
}

/// Advance the outbound message counter, returning the allocated id.
pub fn increment_message_id(
    state: &RelayState,
    id: &ExtensionConnId,
) -> Option<(RelayState, u64)> {
    let entry = state.extensions.get(id)?;
    let allocated = entry.next_message_id;
    let mut updated = (**entry).clone();
    updated.next_message_id += 1;
    Some((replace_entry(state, updated), allocated))
}

pub fn add_playwright_client(state: &RelayState, client: PlaywrightClient) -> RelayState {
    let mut next = state.clone();
    next.playwright_clients
        .insert(client.id.clone(), Arc::new(client));
    next
}

pub fn remove_playwright_client(state: &RelayState, id: &ClientId) -> Option<RelayState> {
    if !state.playwright_clients.contains_key(id) {
        return None;
    }
    let mut next = state.clone();
    next.playwright_clients.remove(id);
    Some(next)
}

pub fn remove_clients_for_extension(
    state: &RelayState,
    extension: &ExtensionConnId,
) -> Option<RelayState> {
    if !state
        .playwright_clients
        .values()
        .any(|client| client.extension_id == *extension)
    {
        return None;
    }
    let mut next = state.clone();
    next.playwright_clients
        .retain(|_, client| client.extension_id != *extension);
    Some(next)
}

/// Insert or update a target. Updating preserves the prior `frame_ids` set so
/// frame bookkeeping survives repeated attach events for the same session.
pub fn add_target(
    state: &RelayState,
    extension: &ExtensionConnId,
    target: ConnectedTarget,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    let mut updated = (**entry).clone();
    let mut target = target;
    if let Some(existing) = updated.connected_targets.get(&target.session_id) {
        target.frame_ids = existing.frame_ids.clone();
    }
    updated
        .connected_targets
        .insert(target.session_id.clone(), target);
    Some(replace_entry(state, updated))
}

pub fn remove_target(
    state: &RelayState,
    extension: &ExtensionConnId,
    session_id: &CdpSessionId,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    if !entry.connected_targets.contains_key(session_id) {
        return None;
    }
    let mut updated = (**entry).clone();
    updated.connected_targets.remove(session_id);
    Some(replace_entry(state, updated))
}

/// Crash removal is keyed by target id because `Target.targetCrashed` carries
/// no session id.
pub fn remove_target_by_crash(
    state: &RelayState,
    extension: &ExtensionConnId,
    target_id: &TargetId,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    if !entry
        .connected_targets
        .values()
        .any(|target| target.target_id == *target_id)
    {
        return None;
    }
    let mut updated = (**entry).clone();
    updated
        .connected_targets
        .retain(|_, target| target.target_id != *target_id);
    Some(replace_entry(state, updated))
}

/// Replace the stored `targetInfo` for whichever session owns the target id.
/// Applying the same info twice is a no-op after the first application.
pub fn update_target_info(
    state: &RelayState,
    extension: &ExtensionConnId,
    info: TargetInfo,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    let session = entry
        .connected_targets
        .values()
        .find(|target| target.target_id == info.target_id)
        .map(|target| target.session_id.clone())?;
    if entry.connected_targets[&session].target_info == info {
        return None;
    }
    let mut updated = (**entry).clone();
    if let Some(target) = updated.connected_targets.get_mut(&session) {
        target.target_info = info;
    }
    Some(replace_entry(state, updated))
}

/// Associate a frame with a session. A frame belongs to one page at a time,
/// so it is removed from every other target of the same extension first.
pub fn add_frame_id(
    state: &RelayState,
    extension: &ExtensionConnId,
    session_id: &CdpSessionId,
    frame_id: FrameId,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    let owner = entry.connected_targets.get(session_id)?;
    if owner.frame_ids.contains(&frame_id) {
        return None;
    }
    let mut updated = (**entry).clone();
    for target in updated.connected_targets.values_mut() {
        target.frame_ids.remove(&frame_id);
    }
    if let Some(target) = updated.connected_targets.get_mut(session_id) {
        target.frame_ids.insert(frame_id);
    }
    Some(replace_entry(state, updated))
}

pub fn remove_frame_id(
    state: &RelayState,
    extension: &ExtensionConnId,
    frame_id: &FrameId,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    if !entry
        .connected_targets
        .values()
        .any(|target| target.frame_ids.contains(frame_id))
    {
        return None;
    }
    let mut updated = (**entry).clone();
    for target in updated.connected_targets.values_mut() {
        target.frame_ids.remove(frame_id);
    }
    Some(replace_entry(state, updated))
}

pub fn update_target_url(
    state: &RelayState,
    extension: &ExtensionConnId,
    session_id: &CdpSessionId,
    url: &str,
    title: Option<&str>,
) -> Option<RelayState> {
    let entry = state.extensions.get(extension)?;
    let target = entry.connected_targets.get(session_id)?;
    let title_unchanged = title.map_or(true, |t| target.target_info.title == t);
    if target.target_info.url == url && title_unchanged {
        return None;
    }
    let mut updated = (**entry).clone();
    if let Some(target) = updated.connected_targets.get_mut(session_id) {
        target.target_info.url = url.to_string();
        if let Some(title) = title {
            target.target_info.title = title.to_string();
        }
    }
    Some(replace_entry(state, updated))
}

fn replace_entry(state: &RelayState, entry: ExtensionEntry) -> RelayState {
    let mut next = state.clone();
    next.extensions.insert(entry.id.clone(), Arc::new(entry));
    next
}

/// Frame-id sets must stay disjoint across targets of one extension.
pub fn frame_ids_disjoint(entry: &ExtensionEntry) -> bool {
    let mut seen: HashSet<&FrameId> = HashSet::new();
    for target in entry.connected_targets.values() {
        for frame in &target.frame_ids {
            if !seen.insert(frame) {
                return false;
            }
        }
    }
    true
}
