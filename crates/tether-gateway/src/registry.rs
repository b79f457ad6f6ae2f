//! Users connected to this process.
//!
//! One mutex around one map. Request handlers, disconnect cleanup and the
//! fanout delivery task all go through it, and nothing else is ever called
//! while it is held.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use tether_types::models::UserId;

/// Non-owning reference to a transport session.
///
/// The transport owns the socket; the handle only carries the outbound queue
/// feeding it. Two handles are equal when they refer to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the transport drains into the socket.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame for the peer. Returns false if the connection is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<bool, serde_json::Error> {
        Ok(self.send(serde_json::to_string(value)?))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The map has no invariants spanning entries, so a panic in another
    // holder cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `user_id` on `handle`. Returns false, leaving the registry
    /// untouched, if the user is already connected here or the handle is
    /// already bound to a user. A handle maps to at most one user.
    pub fn put(&self, user_id: UserId, handle: ConnectionHandle) -> bool {
        let mut connections = self.lock();
        if connections.contains_key(&user_id) || connections.values().any(|h| *h == handle) {
            return false;
        }
        connections.insert(user_id, handle);
        true
    }

    pub fn remove(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.lock().remove(&user_id)
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.lock().get(&user_id).cloned()
    }

    /// The user logged in on `handle`, if any.
    pub fn user_of(&self, handle: &ConnectionHandle) -> Option<UserId> {
        self.lock()
            .iter()
            .find(|(_, h)| *h == handle)
            .map(|(id, _)| *id)
    }

    /// Reverse lookup used on disconnect, when only the handle is known.
    pub fn remove_by_handle(&self, handle: &ConnectionHandle) -> Option<UserId> {
        let mut connections = self.lock();
        let user_id = connections
            .iter()
            .find(|(_, h)| *h == handle)
            .map(|(id, _)| *id)?;
        connections.remove(&user_id);
        Some(user_id)
    }

    pub fn drain_all(&self) -> HashSet<UserId> {
        self.lock().drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
