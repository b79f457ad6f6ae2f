//! Cluster-wide publish/subscribe keyed by user id.
//!
//! Each instance subscribes to the channels of the users connected to it. A
//! publish reaches whichever instance currently holds the subscription; with
//! no subscriber the message is dropped, as with any pub/sub broker. Inbound
//! messages arrive on a [`FanoutReceiver`] drained by [`spawn_delivery`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_types::models::UserId;

use crate::error::ChatError;
use crate::service::ChatService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutMessage {
    pub user_id: UserId,
    pub payload: String,
}

pub type FanoutReceiver = mpsc::UnboundedReceiver<FanoutMessage>;

/// One instance's attachment to the cluster channel layer.
///
/// Calls never block on the network: fire-and-forget, no acknowledgement.
pub trait FanoutChannel: Send + Sync {
    fn subscribe(&self, user_id: UserId) -> Result<(), ChatError>;
    fn unsubscribe(&self, user_id: UserId) -> Result<(), ChatError>;
    fn publish(&self, user_id: UserId, payload: &str) -> Result<(), ChatError>;
}

/// Run the delivery context: every inbound fanout message goes to the local
/// connection, or to the offline queue if the user is no longer here.
pub fn spawn_delivery(service: ChatService, mut rx: FanoutReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            service.on_fanout_message(msg.user_id, &msg.payload);
        }
        warn!("Fanout link closed, cluster delivery stopped");
    })
}

// -- Disabled --

/// Stand-in used when no hub is reachable. Local delivery and offline
/// queueing keep working; cluster delivery does not.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFanout;

impl FanoutChannel for DisabledFanout {
    fn subscribe(&self, _user_id: UserId) -> Result<(), ChatError> {
        Err(ChatError::FanoutUnavailable("running without a hub".into()))
    }

    fn unsubscribe(&self, _user_id: UserId) -> Result<(), ChatError> {
        Err(ChatError::FanoutUnavailable("running without a hub".into()))
    }

    fn publish(&self, _user_id: UserId, _payload: &str) -> Result<(), ChatError> {
        Err(ChatError::FanoutUnavailable("running without a hub".into()))
    }
}

// -- In-process hub --

/// In-process broker. Shared by every [`LocalLink`] attached to it; the TCP
/// hub server wraps one of these.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    next_link: u64,
    links: HashMap<u64, mpsc::UnboundedSender<FanoutMessage>>,
    channels: HashMap<UserId, HashSet<u64>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a new link. Messages for users it subscribes arrive on the
    /// returned receiver.
    pub fn attach(&self) -> (LocalLink, FanoutReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let id = state.next_link;
        state.next_link += 1;
        state.links.insert(id, tx);
        (
            LocalLink {
                hub: self.clone(),
                id,
            },
            rx,
        )
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.state().channels.get(&user_id).map_or(0, HashSet::len)
    }

    fn subscribe(&self, link: u64, user_id: UserId) {
        self.state().channels.entry(user_id).or_default().insert(link);
    }

    fn unsubscribe(&self, link: u64, user_id: UserId) {
        let mut state = self.state();
        if let Some(subscribers) = state.channels.get_mut(&user_id) {
            subscribers.remove(&link);
            if subscribers.is_empty() {
                state.channels.remove(&user_id);
            }
        }
    }

    /// Returns how many links the message was handed to.
    fn publish(&self, user_id: UserId, payload: &str) -> usize {
        let mut state = self.state();
        let Some(subscribers) = state.channels.get(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for link in subscribers {
            let sent = state.links.get(link).is_some_and(|tx| {
                tx.send(FanoutMessage {
                    user_id,
                    payload: payload.to_string(),
                })
                .is_ok()
            });
            if sent {
                delivered += 1;
            } else {
                dead.push(*link);
            }
        }

        for link in dead {
            remove_link(&mut state, link);
        }
        delivered
    }

    fn detach(&self, link: u64) {
        remove_link(&mut self.state(), link);
    }
}

fn remove_link(state: &mut HubState, link: u64) {
    state.links.remove(&link);
    state.channels.retain(|_, subscribers| {
        subscribers.remove(&link);
        !subscribers.is_empty()
    });
}

/// A [`LocalHub`] attachment. Dropping it removes all its subscriptions.
pub struct LocalLink {
    hub: LocalHub,
    id: u64,
}

impl FanoutChannel for LocalLink {
    fn subscribe(&self, user_id: UserId) -> Result<(), ChatError> {
        self.hub.subscribe(self.id, user_id);
        Ok(())
    }

    fn unsubscribe(&self, user_id: UserId) -> Result<(), ChatError> {
        self.hub.unsubscribe(self.id, user_id);
        Ok(())
    }

    fn publish(&self, user_id: UserId, payload: &str) -> Result<(), ChatError> {
        let receivers = self.hub.publish(user_id, payload);
        if receivers == 0 {
            // Presence says online but no instance holds the subscription
            warn!(user_id, "Fanout message dropped: no subscriber");
        } else {
            debug!(user_id, receivers, "Published to fanout channel");
        }
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}
