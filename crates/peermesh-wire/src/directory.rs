//! Endpoint directory: tracks every known endpoint and its connection state.
//!
//! Each endpoint id is in exactly one of three states: not known, contacted
//! (waiting for approval), or approved. All state lives behind one lock.
//! Listeners are invoked after the lock is released, on the thread that
//! performed the mutation, so they may call back into the directory.

use peermesh_types::{EndpointId, EndpointInformation};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Something that happened to an approved endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// The endpoint completed its handshake and may now be used.
    Connected(EndpointInformation),
    /// The endpoint is being removed.
    Disconnecting(EndpointInformation),
}

/// Callback invoked for every directory event.
pub type DirectoryListener = Arc<dyn Fn(&DirectoryEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct DirectoryState {
    /// Contacted endpoints waiting for the handshake to finish.
    waiting: HashMap<EndpointId, EndpointInformation>,
    /// Endpoints that completed the handshake.
    approved: HashMap<EndpointId, EndpointInformation>,
}

/// Thread-safe registry of all known endpoints.
pub struct EndpointDirectory {
    state: Mutex<DirectoryState>,
    listeners: RwLock<Vec<DirectoryListener>>,
}

impl EndpointDirectory {
    /// Create a new empty directory.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for connect/disconnect events.
    pub fn add_listener(&self, listener: DirectoryListener) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn notify(&self, event: DirectoryEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Mark an endpoint as contacted. Returns `false` if it is already
    /// contacted or approved.
    pub fn try_start_approval(&self, info: EndpointInformation) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.approved.contains_key(&info.id) || state.waiting.contains_key(&info.id) {
            return false;
        }
        debug!(endpoint = %info.id, "Endpoint contacted, waiting for approval");
        state.waiting.insert(info.id.clone(), info);
        true
    }

    /// Drop an endpoint that is still waiting for approval. Approved
    /// endpoints are left alone.
    pub fn try_cancel_approval(&self, id: &EndpointId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.remove(id).is_some()
    }

    /// Register an endpoint as approved. This is the only place that fires
    /// [`DirectoryEvent::Connected`].
    ///
    /// Adding an id that is already approved with the same information is a
    /// no-op returning `false`. Different information (the endpoint
    /// restarted) replaces the old entry: `Disconnecting` fires for the old
    /// instance before `Connected` fires for the new one.
    pub fn try_add(&self, info: EndpointInformation) -> bool {
        self.approve(info, false)
    }

    /// Like [`try_add`](Self::try_add), but only for an endpoint that is
    /// still contacted or already approved. An endpoint forgotten while its
    /// handshake was finishing stays forgotten.
    pub fn try_approve(&self, info: EndpointInformation) -> bool {
        self.approve(info, true)
    }

    fn approve(&self, info: EndpointInformation, require_known: bool) -> bool {
        let replaced = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let waiting = state.waiting.remove(&info.id).is_some();
            match state.approved.get(&info.id) {
                Some(existing) if *existing == info => return false,
                None if require_known && !waiting => {
                    debug!(endpoint = %info.id, "Endpoint forgotten before approval");
                    return false;
                }
                _ => state.approved.insert(info.id.clone(), info.clone()),
            }
        };

        if let Some(old) = replaced {
            info!(endpoint = %old.id, "Endpoint reconnected with new addresses");
            self.notify(DirectoryEvent::Disconnecting(old));
        }
        info!(
            endpoint = %info.id,
            address = %info.protocol.message_address,
            "Endpoint connected"
        );
        self.notify(DirectoryEvent::Connected(info));
        true
    }

    /// Forget an endpoint in whatever state it is in. Fires
    /// [`DirectoryEvent::Disconnecting`] if it was approved.
    pub fn try_remove_endpoint(&self, id: &EndpointId) -> bool {
        let (waiting, approved) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.waiting.remove(id), state.approved.remove(id))
        };
        if let Some(info) = approved {
            info!(endpoint = %id, "Endpoint disconnected");
            self.notify(DirectoryEvent::Disconnecting(info));
            return true;
        }
        waiting.is_some()
    }

    /// Remove every endpoint, firing `Disconnecting` for each approved one.
    pub fn clear(&self) -> Vec<EndpointInformation> {
        let removed: Vec<EndpointInformation> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.waiting.clear();
            state.approved.drain().map(|(_, info)| info).collect()
        };
        for info in &removed {
            self.notify(DirectoryEvent::Disconnecting(info.clone()));
        }
        removed
    }

    /// Connection information for an approved endpoint.
    pub fn try_get_connection_for(&self, id: &EndpointId) -> Option<EndpointInformation> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.approved.get(id).cloned()
    }

    /// Addresses for any endpoint we may send to: approved or waiting.
    pub fn contact_information_for(&self, id: &EndpointId) -> Option<EndpointInformation> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .approved
            .get(id)
            .or_else(|| state.waiting.get(id))
            .cloned()
    }

    /// Whether the endpoint completed its handshake.
    pub fn can_communicate_with_endpoint(&self, id: &EndpointId) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.approved.contains_key(id)
    }

    /// Whether a handshake with the endpoint is in progress.
    pub fn is_waiting_for_approval(&self, id: &EndpointId) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.contains_key(id)
    }

    /// Whether the endpoint is known in any state.
    pub fn has_been_contacted(&self, id: &EndpointId) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.contains_key(id) || state.approved.contains_key(id)
    }

    /// Ids of all approved endpoints.
    pub fn known_endpoints(&self) -> Vec<EndpointId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.approved.keys().cloned().collect()
    }

    /// Number of approved endpoints.
    pub fn connected_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.approved.len()
    }
}

impl Default for EndpointDirectory {
    fn default() -> Self {
        Self::new()
    }
}
