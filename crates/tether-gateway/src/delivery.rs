//! Recipient resolution: local connection, then cluster publish, then the
//! offline queue. Every attempt lands in exactly one tier.

use tracing::{debug, error, warn};

use tether_types::models::UserId;

use crate::error::ChatError;
use crate::service::ChatService;

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to a connection held by this instance.
    Local,
    /// Handed to the fanout channel for the instance holding the recipient.
    Published,
    /// Stored for the recipient's next login.
    Queued,
}

impl ChatService {
    /// Deliver `payload` to `to`.
    ///
    /// Only fails when the message could be neither sent nor queued.
    pub fn deliver(&self, to: UserId, payload: &str) -> Result<Delivery, ChatError> {
        if let Some(conn) = self.registry().lookup(to) {
            if conn.send(payload) {
                debug!(user_id = to, "Delivered locally");
                return Ok(Delivery::Local);
            }
            // Registered but the writer is gone; the disconnect is in flight
            debug!(user_id = to, conn = %conn.id(), "Local connection closed, queueing");
            return self.enqueue(to, payload);
        }

        let online = match self.store().query_user(to) {
            Ok(account) => account.is_some_and(|a| a.user.presence.is_online()),
            Err(e) => {
                warn!(user_id = to, "Presence lookup failed, treating as offline: {:#}", e);
                false
            }
        };

        if online {
            match self.fanout().publish(to, payload) {
                Ok(()) => {
                    debug!(user_id = to, "Published to cluster");
                    return Ok(Delivery::Published);
                }
                Err(e) => warn!(user_id = to, "Publish failed, queueing: {}", e),
            }
        }

        self.enqueue(to, payload)
    }

    fn enqueue(&self, to: UserId, payload: &str) -> Result<Delivery, ChatError> {
        self.store().enqueue_offline(to, payload).map_err(|e| {
            error!(user_id = to, "Message lost, offline queue unavailable: {:#}", e);
            ChatError::store(e)
        })?;
        debug!(user_id = to, "Queued offline");
        Ok(Delivery::Queued)
    }

    /// A message for `user_id` arrived from the fanout channel.
    ///
    /// The subscription is only held while the user is connected here, but
    /// a logout can race the publish; in that case the message is queued.
    pub fn on_fanout_message(&self, user_id: UserId, payload: &str) {
        if let Some(conn) = self.registry().lookup(user_id) {
            if conn.send(payload) {
                debug!(user_id, "Delivered from cluster");
                return;
            }
        }

        debug!(user_id, "Cluster message for a user no longer here, queueing");
        if let Err(e) = self.store().enqueue_offline(user_id, payload) {
            error!(user_id, "Message lost, offline queue unavailable: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use tether_db::Database;
    use tether_types::models::Presence;

    use super::*;
    use crate::fanout::DisabledFanout;
    use crate::service::testing::*;

    #[test]
    fn local_recipient_is_written_directly() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let bob = cluster.user("bob", "pw");
        let (conn, mut rx) = connection();
        node.service.login(&conn, bob, "pw").unwrap();

        assert_eq!(node.service.deliver(bob, "hi").unwrap(), Delivery::Local);
        assert_eq!(rx.try_recv().unwrap(), "hi");
        assert!(cluster.offline_queue(bob).is_empty());
    }

    #[test]
    fn remote_recipient_is_published_once() {
        let cluster = Cluster::new();
        let east = cluster.node();
        let mut west = cluster.node();
        let bob = cluster.user("bob", "pw");
        let (conn, mut rx) = connection();
        west.service.login(&conn, bob, "pw").unwrap();

        assert_eq!(east.service.deliver(bob, "hi").unwrap(), Delivery::Published);
        assert_eq!(west.pump(), 1);
        assert_eq!(rx.try_recv().unwrap(), "hi");
        assert!(rx.try_recv().is_err());
        assert!(cluster.offline_queue(bob).is_empty());
    }

    #[test]
    fn offline_recipient_is_queued_in_order() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let bob = cluster.user("bob", "pw");

        for text in ["one", "two", "three"] {
            assert_eq!(node.service.deliver(bob, text).unwrap(), Delivery::Queued);
        }

        let (conn, _rx) = connection();
        let ack = node.service.login(&conn, bob, "pw").unwrap();
        assert_eq!(ack.offline_messages, vec!["one", "two", "three"]);
        assert!(cluster.offline_queue(bob).is_empty());
    }

    #[test]
    fn unknown_recipient_is_queued() {
        let cluster = Cluster::new();
        let node = cluster.node();
        assert_eq!(node.service.deliver(999, "hello?").unwrap(), Delivery::Queued);
        assert_eq!(cluster.offline_queue(999), vec!["hello?"]);
    }

    #[test]
    fn closed_local_connection_falls_back_to_queue() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let bob = cluster.user("bob", "pw");
        let (conn, rx) = connection();
        node.service.login(&conn, bob, "pw").unwrap();
        drop(rx);

        assert_eq!(node.service.deliver(bob, "late").unwrap(), Delivery::Queued);
        assert_eq!(cluster.offline_queue(bob), vec!["late"]);
    }

    #[test]
    fn degraded_mode_queues_instead_of_publishing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let service = ChatService::new(db.clone(), Arc::new(DisabledFanout));
        let bob = service.register("bob", "pw").unwrap();
        // Online on some other instance
        db.set_user_state(bob, Presence::Online).unwrap();

        assert_eq!(service.deliver(bob, "hi").unwrap(), Delivery::Queued);
        assert_eq!(db.count_offline(bob).unwrap(), 1);

        // Local delivery still works and login survives the subscribe failure
        let carol = service.register("carol", "pw").unwrap();
        let (conn, mut rx) = connection();
        service.login(&conn, carol, "pw").unwrap();
        assert_eq!(service.deliver(carol, "hey").unwrap(), Delivery::Local);
        assert_eq!(rx.try_recv().unwrap(), "hey");
    }

    #[test]
    fn peer_restart_keeps_live_users_reachable() {
        let cluster = Cluster::new();
        let mut east = cluster.node();
        let alice = cluster.user("alice", "pw");
        let (conn, mut rx) = connection();
        east.service.login(&conn, alice, "pw").unwrap();

        // A peer stops and a fresh one starts in its place
        let west = cluster.node();
        west.service.release_local();
        drop(west);
        let west = cluster.node();

        assert_eq!(west.service.deliver(alice, "still here").unwrap(), Delivery::Published);
        assert_eq!(east.pump(), 1);
        assert_eq!(rx.try_recv().unwrap(), "still here");
        assert!(cluster.offline_queue(alice).is_empty());
    }

    #[test]
    fn failed_queue_write_is_reported() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let bob = cluster.user("bob", "pw");
        cluster.faults.enqueue.store(true, Ordering::SeqCst);

        assert!(matches!(
            node.service.deliver(bob, "lost"),
            Err(ChatError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn fanout_message_for_departed_user_is_queued() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let bob = cluster.user("bob", "pw");

        node.service.on_fanout_message(bob, "raced");
        assert_eq!(cluster.offline_queue(bob), vec!["raced"]);
    }
}
