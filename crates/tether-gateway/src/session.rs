//! Login, logout, disconnect and the crash-recovery sweep.
//!
//! Per user: offline -> online on login, online -> offline on logout,
//! disconnect or reset. Presence lives in the store; registry membership
//! mirrors it for users connected to this instance.

use tracing::{debug, error, info, warn};

use tether_db::credential::{hash_password, verify_password};
use tether_types::messages::LoginAck;
use tether_types::models::{Presence, User, UserId};

use crate::error::ChatError;
use crate::registry::ConnectionHandle;
use crate::service::ChatService;

impl ChatService {
    /// Log `id` in on `conn` and build the login-completion response.
    ///
    /// On success the user is in the registry, subscribed to its fanout
    /// channel, online in the store, and its offline queue is empty.
    pub fn login(&self, conn: &ConnectionHandle, id: UserId, password: &str) -> Result<LoginAck, ChatError> {
        if let Some(bound) = self.registry().user_of(conn) {
            info!(user_id = id, bound, conn = %conn.id(), "Login rejected: connection already logged in");
            return Err(ChatError::DuplicateSession);
        }

        let account = self
            .store()
            .query_user(id)
            .map_err(|e| {
                error!(user_id = id, "Login lookup failed: {:#}", e);
                ChatError::store(e)
            })?
            .ok_or(ChatError::InvalidCredential)?;

        if !verify_password(password, &account.password_hash) {
            info!(user_id = id, "Login rejected: bad credentials");
            return Err(ChatError::InvalidCredential);
        }

        if account.user.presence.is_online() {
            info!(user_id = id, "Login rejected: already online");
            return Err(ChatError::DuplicateSession);
        }

        if !self.registry().put(id, conn.clone()) {
            info!(user_id = id, "Login rejected: already connected here");
            return Err(ChatError::DuplicateSession);
        }

        if let Err(e) = self.fanout().subscribe(id) {
            warn!(user_id = id, "Fanout subscribe failed, cluster delivery disabled for this session: {}", e);
        }

        match self.complete_login(&account.user) {
            Ok(ack) => {
                info!(
                    user_id = id,
                    conn = %conn.id(),
                    offline = ack.offline_messages.len(),
                    "{} logged in",
                    account.user.name
                );
                Ok(ack)
            }
            Err(e) => {
                error!(user_id = id, "Login aborted: {}", e);
                self.rollback_login(id, conn);
                Err(e)
            }
        }
    }

    fn complete_login(&self, user: &User) -> Result<LoginAck, ChatError> {
        let store = self.store();
        store
            .update_presence(user.id, Presence::Online)
            .map_err(ChatError::store)?;

        let friends = store.query_friends(user.id).map_err(ChatError::store)?;
        let groups = store.query_groups_for_user(user.id).map_err(ChatError::store)?;
        // Drain last: nothing after it can fail and lose the drained messages
        let offline = store.drain_offline(user.id).map_err(ChatError::store)?;

        let online = User {
            presence: Presence::Online,
            ..user.clone()
        };
        Ok(LoginAck::success(&online, offline, &friends, &groups))
    }

    fn rollback_login(&self, id: UserId, conn: &ConnectionHandle) {
        self.registry().remove_by_handle(conn);
        self.release(id);
    }

    /// Explicit logout. Idempotent.
    pub fn logout(&self, id: UserId) {
        self.registry().remove(id);
        self.release(id);
        info!(user_id = id, "Logged out");
    }

    /// Transport reported `conn` closed. No-op if it never logged in.
    pub fn handle_disconnect(&self, conn: &ConnectionHandle) {
        let Some(id) = self.registry().remove_by_handle(conn) else {
            debug!(conn = %conn.id(), "Disconnect of an anonymous connection");
            return;
        };
        self.release(id);
        info!(user_id = id, conn = %conn.id(), "Disconnected");
    }

    /// Drop the fanout subscription and mark the user offline. Best effort.
    fn release(&self, id: UserId) {
        if let Err(e) = self.fanout().unsubscribe(id) {
            warn!(user_id = id, "Fanout unsubscribe failed: {}", e);
        }
        if let Err(e) = self.store().update_presence(id, Presence::Offline) {
            warn!(user_id = id, "Failed to mark user offline: {:#}", e);
        }
    }

    /// Crash-recovery sweep: every user offline in the store, whatever this
    /// instance's registry says.
    pub fn reset(&self) -> Result<usize, ChatError> {
        let count = self
            .store()
            .reset_all_presence_offline()
            .map_err(ChatError::store)?;
        info!(count, "Presence reset: all users offline");
        Ok(count)
    }

    /// Release every user connected to this instance: unsubscribe and mark
    /// offline. Users on other instances are untouched. Returns how many
    /// were released.
    pub fn release_local(&self) -> usize {
        let users = self.registry().drain_all();
        for &id in &users {
            self.release(id);
        }
        info!(count = users.len(), "Released local sessions");
        users.len()
    }

    /// Create an account. Returns the assigned id.
    pub fn register(&self, name: &str, password: &str) -> Result<UserId, ChatError> {
        let name = name.trim();
        if name.is_empty() || password.is_empty() {
            return Err(ChatError::RegistrationFailed("name and password are required".into()));
        }

        let id = hash_password(password)
            .and_then(|hash| self.store().insert_user(name, &hash))
            .map_err(|e| {
                warn!("Registration of {} failed: {:#}", name, e);
                ChatError::RegistrationFailed(format!("{:#}", e))
            })?;

        info!(user_id = id, "Registered {}", name);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::service::testing::*;
    use crate::error::ChatError;
    use tether_types::models::{GroupRole, Presence};

    #[test]
    fn scenario_register_login_duplicate_logout() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let service = &node.service;

        let alice = service.register("alice", "pw1").unwrap();
        assert!(alice > 0);

        let (conn, _rx) = connection();
        assert!(matches!(
            service.login(&conn, alice, "wrong"),
            Err(ChatError::InvalidCredential)
        ));
        assert!(service.registry().is_empty());

        let ack = service.login(&conn, alice, "pw1").unwrap();
        assert_eq!(ack.errno, 0);
        assert_eq!(ack.id, Some(alice));
        assert_eq!(ack.name.as_deref(), Some("alice"));
        assert_eq!(cluster.presence(alice), Presence::Online);
        assert_eq!(service.registry().lookup(alice), Some(conn.clone()));
        assert_eq!(cluster.hub.subscriber_count(alice), 1);

        let (second, _rx2) = connection();
        let err = service.login(&second, alice, "pw1").unwrap_err();
        assert!(matches!(err, ChatError::DuplicateSession));
        assert_eq!(err.errno(), 2);
        // The first session is untouched
        assert_eq!(service.registry().lookup(alice), Some(conn.clone()));
        assert_eq!(cluster.hub.subscriber_count(alice), 1);

        service.logout(alice);
        assert_eq!(cluster.presence(alice), Presence::Offline);
        assert!(service.registry().is_empty());
        assert_eq!(cluster.hub.subscriber_count(alice), 0);
    }

    #[test]
    fn login_rejects_unknown_users() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let (conn, _rx) = connection();
        assert!(matches!(
            node.service.login(&conn, 4242, "pw"),
            Err(ChatError::InvalidCredential)
        ));
    }

    #[test]
    fn duplicate_login_is_detected_across_instances() {
        let cluster = Cluster::new();
        let east = cluster.node();
        let west = cluster.node();
        let alice = cluster.user("alice", "pw");

        let (c1, _rx1) = connection();
        east.service.login(&c1, alice, "pw").unwrap();

        let (c2, _rx2) = connection();
        assert!(matches!(
            west.service.login(&c2, alice, "pw"),
            Err(ChatError::DuplicateSession)
        ));
        assert!(west.service.registry().is_empty());
        assert_eq!(cluster.hub.subscriber_count(alice), 1);
    }

    #[test]
    fn login_returns_friends_groups_and_drains_the_queue() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");
        let bob = cluster.user("bob", "pw");
        cluster.db.add_friend(alice, bob).unwrap();
        let group = cluster.db.create_group("rust", "crabs").unwrap();
        cluster.db.add_group_member(group, bob, GroupRole::Creator).unwrap();
        cluster.db.add_group_member(group, alice, GroupRole::Normal).unwrap();
        cluster.db.enqueue_offline(alice, "first").unwrap();
        cluster.db.enqueue_offline(alice, "second").unwrap();

        let (conn, _rx) = connection();
        let ack = node.service.login(&conn, alice, "pw").unwrap();

        assert_eq!(ack.offline_messages, vec!["first", "second"]);
        assert_eq!(cluster.db.count_offline(alice).unwrap(), 0);
        assert_eq!(ack.friends.len(), 1);
        assert_eq!(ack.friends[0].id, bob);
        assert_eq!(ack.friends[0].state, Presence::Offline);
        assert_eq!(ack.groups.len(), 1);
        assert_eq!(ack.groups[0].users.len(), 2);
        assert_eq!(ack.groups[0].users[0].role, GroupRole::Creator);
        assert_eq!(ack.groups[0].users[1].state, Presence::Online);
    }

    #[test]
    fn store_failure_during_login_rolls_back() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");

        cluster.faults.presence_online.store(true, Ordering::SeqCst);
        let (conn, _rx) = connection();
        let err = node.service.login(&conn, alice, "pw").unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
        assert_eq!(err.errno(), 1);
        assert!(node.service.registry().is_empty());
        assert_eq!(cluster.hub.subscriber_count(alice), 0);
        assert_eq!(cluster.presence(alice), Presence::Offline);

        // Failure after presence was set online is rolled back too
        cluster.faults.presence_online.store(false, Ordering::SeqCst);
        cluster.faults.drain.store(true, Ordering::SeqCst);
        cluster.db.enqueue_offline(alice, "kept").unwrap();
        assert!(node.service.login(&conn, alice, "pw").is_err());
        assert!(node.service.registry().is_empty());
        assert_eq!(cluster.presence(alice), Presence::Offline);
        assert_eq!(cluster.db.count_offline(alice).unwrap(), 1);

        // And a clean retry works
        cluster.faults.drain.store(false, Ordering::SeqCst);
        let ack = node.service.login(&conn, alice, "pw").unwrap();
        assert_eq!(ack.offline_messages, vec!["kept"]);
    }

    #[test]
    fn store_lookup_failure_is_a_credential_class_error() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");
        cluster.faults.query_user.store(true, Ordering::SeqCst);

        let (conn, _rx) = connection();
        let err = node.service.login(&conn, alice, "pw").unwrap_err();
        assert_eq!(err.errno(), 1);
        assert!(node.service.registry().is_empty());
    }

    #[test]
    fn disconnect_cleans_up_and_ignores_strangers() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");

        let (stranger, _rxs) = connection();
        node.service.handle_disconnect(&stranger);

        let (conn, _rx) = connection();
        node.service.login(&conn, alice, "pw").unwrap();
        node.service.handle_disconnect(&conn);

        assert!(node.service.registry().lookup(alice).is_none());
        assert_eq!(cluster.presence(alice), Presence::Offline);
        assert_eq!(cluster.hub.subscriber_count(alice), 0);

        // A second disconnect event for the same handle is harmless
        node.service.handle_disconnect(&conn);
    }

    #[test]
    fn a_logged_in_connection_cannot_take_a_second_identity() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");
        let bob = cluster.user("bob", "pw");

        let (conn, _rx) = connection();
        node.service.login(&conn, alice, "pw").unwrap();
        let err = node.service.login(&conn, bob, "pw").unwrap_err();
        assert!(matches!(err, ChatError::DuplicateSession));
        assert!(node.service.registry().lookup(bob).is_none());
        assert_eq!(cluster.presence(bob), Presence::Offline);
        assert_eq!(cluster.hub.subscriber_count(bob), 0);

        node.service.handle_disconnect(&conn);
        assert!(node.service.registry().is_empty());
        assert_eq!(cluster.presence(alice), Presence::Offline);

        // Both can log in again on fresh connections
        let (a, _ra) = connection();
        let (b, _rb) = connection();
        node.service.login(&a, alice, "pw").unwrap();
        node.service.login(&b, bob, "pw").unwrap();
    }

    #[test]
    fn release_local_leaves_other_instances_alone() {
        let cluster = Cluster::new();
        let east = cluster.node();
        let west = cluster.node();
        let alice = cluster.user("alice", "pw");
        let bob = cluster.user("bob", "pw");

        let (a, _ra) = connection();
        let (b, _rb) = connection();
        east.service.login(&a, alice, "pw").unwrap();
        west.service.login(&b, bob, "pw").unwrap();

        assert_eq!(west.service.release_local(), 1);
        assert!(west.service.registry().is_empty());
        assert_eq!(cluster.presence(bob), Presence::Offline);
        assert_eq!(cluster.hub.subscriber_count(bob), 0);

        assert_eq!(cluster.presence(alice), Presence::Online);
        assert_eq!(east.service.registry().lookup(alice), Some(a));
        assert_eq!(cluster.hub.subscriber_count(alice), 1);

        // Still a single session for alice across the cluster
        let (again, _rx) = connection();
        assert!(matches!(
            west.service.login(&again, alice, "pw"),
            Err(ChatError::DuplicateSession)
        ));
    }

    #[test]
    fn logout_is_idempotent() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");
        node.service.logout(alice);
        node.service.logout(alice);
        assert_eq!(cluster.presence(alice), Presence::Offline);
    }

    #[test]
    fn reset_marks_everyone_offline_and_is_idempotent() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let alice = cluster.user("alice", "pw");
        let bob = cluster.user("bob", "pw");
        let carol = cluster.user("carol", "pw");
        cluster.db.set_user_state(alice, Presence::Online).unwrap();
        cluster.db.set_user_state(bob, Presence::Online).unwrap();

        assert_eq!(node.service.reset().unwrap(), 2);
        assert_eq!(node.service.reset().unwrap(), 0);
        for id in [alice, bob, carol] {
            assert_eq!(cluster.presence(id), Presence::Offline);
        }
    }

    #[test]
    fn register_rejects_duplicates_and_blanks() {
        let cluster = Cluster::new();
        let node = cluster.node();
        node.service.register("alice", "pw").unwrap();

        let err = node.service.register("alice", "other").unwrap_err();
        assert!(matches!(err, ChatError::RegistrationFailed(_)));
        assert_eq!(err.errno(), 3);
        assert!(node.service.register("  ", "pw").is_err());
        assert!(node.service.register("bob", "").is_err());
    }
}
