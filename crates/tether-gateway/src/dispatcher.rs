use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::error;

use tether_types::messages::MsgKind;

use crate::error::ChatError;
use crate::handlers;
use crate::registry::ConnectionHandle;
use crate::service::ChatService;

/// A message handler: the service, the originating connection, the decoded
/// frame and the time it was received.
pub type MsgHandler = Arc<
    dyn Fn(&ChatService, &ConnectionHandle, &Value, DateTime<Utc>) -> Result<(), ChatError>
        + Send
        + Sync,
>;

/// Maps a frame's `msgid` to its handler. Fixed after startup.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<i64, MsgHandler>,
}

impl DispatchTable {
    /// An empty table. Every tag resolves to the unknown-message handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with every client request kind registered.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(MsgKind::Login, handlers::login);
        table.register(MsgKind::Logout, handlers::logout);
        table.register(MsgKind::Register, handlers::register);
        table.register(MsgKind::OneChat, handlers::one_chat);
        table.register(MsgKind::AddFriend, handlers::add_friend);
        table.register(MsgKind::CreateGroup, handlers::create_group);
        table.register(MsgKind::AddGroup, handlers::add_group);
        table.register(MsgKind::GroupChat, handlers::group_chat);
        table
    }

    /// Install `handler` for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: MsgKind, handler: F)
    where
        F: Fn(&ChatService, &ConnectionHandle, &Value, DateTime<Utc>) -> Result<(), ChatError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(kind.id(), Arc::new(handler));
    }

    pub fn is_registered(&self, msgid: i64) -> bool {
        self.handlers.contains_key(&msgid)
    }

    /// Never fails: unknown tags get a handler that logs and does nothing.
    pub fn resolve(&self, msgid: i64) -> MsgHandler {
        match self.handlers.get(&msgid) {
            Some(handler) => handler.clone(),
            None => Arc::new(
                move |_: &ChatService, conn: &ConnectionHandle, _: &Value, _: DateTime<Utc>| {
                    error!(msgid, conn = %conn.id(), "No handler for msgid, frame ignored");
                    Ok(())
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::service::testing::*;

    #[test]
    fn standard_table_covers_client_requests() {
        let table = DispatchTable::standard();
        for kind in [1, 3, 4, 6, 7, 8, 9, 10] {
            assert!(table.is_registered(kind), "msgid {} missing", kind);
        }
        // Acks are server-to-client only
        assert!(!table.is_registered(MsgKind::LoginAck.id()));
        assert!(!table.is_registered(MsgKind::RegisterAck.id()));
    }

    #[test]
    fn unknown_tag_resolves_to_a_no_op() {
        let cluster = Cluster::new();
        let node = cluster.node();
        let (conn, mut rx) = connection();

        let handler = DispatchTable::standard().resolve(999);
        assert!(handler(&node.service, &conn, &json!({"msgid": 999}), Utc::now()).is_ok());
        assert!(received(&mut rx).is_empty());
        assert!(!conn.is_closed());
    }

    #[test]
    fn custom_handlers_are_invoked() {
        let cluster = Cluster::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut table = DispatchTable::new();
        let counter = calls.clone();
        table.register(MsgKind::OneChat, move |_, _, frame, _| {
            assert_eq!(frame["msg"], "ping");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let service = ChatService::with_handlers(
            cluster.db.clone(),
            Arc::new(crate::fanout::DisabledFanout),
            table,
        );
        let (conn, _rx) = connection();
        service.dispatch(&conn, &json!({"msgid": 6, "msg": "ping"}), Utc::now());
        service.dispatch(&conn, &json!({"msgid": 1}), Utc::now());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
