use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use tether_types::messages::msgid_of;

use crate::dispatcher::DispatchTable;
use crate::fanout::FanoutChannel;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::store::RecipientStore;

/// The chat service: registry, dispatch table, store and fanout link.
///
/// Built once at startup and cloned into the transport and the fanout
/// delivery task.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    registry: ConnectionRegistry,
    handlers: DispatchTable,
    store: Arc<dyn RecipientStore>,
    fanout: Arc<dyn FanoutChannel>,
}

impl ChatService {
    pub fn new(store: Arc<dyn RecipientStore>, fanout: Arc<dyn FanoutChannel>) -> Self {
        Self::with_handlers(store, fanout, DispatchTable::standard())
    }

    pub fn with_handlers(
        store: Arc<dyn RecipientStore>,
        fanout: Arc<dyn FanoutChannel>,
        handlers: DispatchTable,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry: ConnectionRegistry::new(),
                handlers,
                store,
                fanout,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub(crate) fn store(&self) -> &dyn RecipientStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn fanout(&self) -> &dyn FanoutChannel {
        self.inner.fanout.as_ref()
    }

    /// Route one decoded frame to its handler. Handler failures are logged;
    /// the connection stays open either way.
    pub fn dispatch(&self, conn: &ConnectionHandle, frame: &Value, received_at: DateTime<Utc>) {
        let Some(msgid) = msgid_of(frame) else {
            warn!(conn = %conn.id(), "Frame without an integer msgid, ignored");
            return;
        };

        let handler = self.inner.handlers.resolve(msgid);
        if let Err(e) = handler(self, conn, frame, received_at) {
            warn!(conn = %conn.id(), msgid, "Handler failed: {}", e);
        }
    }

    /// Decode a text frame and dispatch it.
    pub fn dispatch_text(&self, conn: &ConnectionHandle, text: &str, received_at: DateTime<Utc>) {
        match serde_json::from_str::<Value>(text) {
            Ok(frame) => self.dispatch(conn, &frame, received_at),
            Err(e) => {
                warn!(
                    conn = %conn.id(),
                    "Bad frame: {} -- raw: {}",
                    e,
                    truncate(text, 200)
                );
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::{Result, bail};
    use tokio::sync::mpsc;

    use tether_db::Database;
    use tether_db::credential::hash_password;
    use tether_types::models::{Account, Group, GroupId, GroupRole, Presence, User, UserId};

    use crate::fanout::{FanoutChannel, FanoutReceiver, LocalHub};
    use crate::registry::ConnectionHandle;
    use crate::store::RecipientStore;

    use super::ChatService;

    /// Store wrapper whose individual operations can be made to fail.
    #[derive(Default)]
    pub struct Faults {
        pub presence_online: AtomicBool,
        pub drain: AtomicBool,
        pub query_user: AtomicBool,
        pub enqueue: AtomicBool,
    }

    pub struct FlakyStore {
        pub db: Arc<Database>,
        pub faults: Arc<Faults>,
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            bail!("injected failure in {}", op);
        }
        Ok(())
    }

    impl RecipientStore for FlakyStore {
        fn query_user(&self, id: UserId) -> Result<Option<Account>> {
            check(&self.faults.query_user, "query_user")?;
            self.db.query_user(id)
        }
        fn insert_user(&self, name: &str, password_hash: &str) -> Result<UserId> {
            RecipientStore::insert_user(self.db.as_ref(), name, password_hash)
        }
        fn update_presence(&self, id: UserId, presence: Presence) -> Result<()> {
            if presence.is_online() {
                check(&self.faults.presence_online, "update_presence")?;
            }
            self.db.update_presence(id, presence)
        }
        fn reset_all_presence_offline(&self) -> Result<usize> {
            self.db.reset_all_presence_offline()
        }
        fn query_friends(&self, id: UserId) -> Result<Vec<User>> {
            self.db.query_friends(id)
        }
        fn insert_friend_edge(&self, a: UserId, b: UserId) -> Result<()> {
            self.db.insert_friend_edge(a, b)
        }
        fn create_group(&self, name: &str, description: &str) -> Result<GroupId> {
            RecipientStore::create_group(self.db.as_ref(), name, description)
        }
        fn add_group_member(&self, group_id: GroupId, user_id: UserId, role: GroupRole) -> Result<()> {
            RecipientStore::add_group_member(self.db.as_ref(), group_id, user_id, role)
        }
        fn query_groups_for_user(&self, id: UserId) -> Result<Vec<Group>> {
            self.db.query_groups_for_user(id)
        }
        fn query_group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>> {
            self.db.query_group_member_ids(group_id)
        }
        fn enqueue_offline(&self, id: UserId, payload: &str) -> Result<()> {
            check(&self.faults.enqueue, "enqueue_offline")?;
            RecipientStore::enqueue_offline(self.db.as_ref(), id, payload)
        }
        fn drain_offline(&self, id: UserId) -> Result<Vec<String>> {
            check(&self.faults.drain, "drain_offline")?;
            RecipientStore::drain_offline(self.db.as_ref(), id)
        }
    }

    /// One chat service instance attached to a shared hub and database.
    pub struct Node {
        pub service: ChatService,
        pub inbound: FanoutReceiver,
    }

    impl Node {
        /// Hand every pending fanout message to the service, as the delivery
        /// task would.
        pub fn pump(&mut self) -> usize {
            let mut count = 0;
            while let Ok(msg) = self.inbound.try_recv() {
                self.service.on_fanout_message(msg.user_id, &msg.payload);
                count += 1;
            }
            count
        }
    }

    pub struct Cluster {
        pub db: Arc<Database>,
        pub hub: LocalHub,
        pub faults: Arc<Faults>,
    }

    impl Cluster {
        pub fn new() -> Self {
            Self {
                db: Arc::new(Database::open_in_memory().unwrap()),
                hub: LocalHub::new(),
                faults: Arc::new(Faults::default()),
            }
        }

        pub fn node(&self) -> Node {
            let (link, inbound) = self.hub.attach();
            let store = Arc::new(FlakyStore {
                db: self.db.clone(),
                faults: self.faults.clone(),
            });
            let fanout: Arc<dyn FanoutChannel> = Arc::new(link);
            Node {
                service: ChatService::new(store, fanout),
                inbound,
            }
        }

        pub fn user(&self, name: &str, password: &str) -> UserId {
            self.db.create_user(name, &hash_password(password).unwrap()).unwrap()
        }

        pub fn presence(&self, id: UserId) -> Presence {
            self.db.query_user(id).unwrap().unwrap().user.presence
        }

        pub fn offline_queue(&self, id: UserId) -> Vec<String> {
            RecipientStore::drain_offline(self.db.as_ref(), id).unwrap()
        }
    }

    pub fn connection() -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        ConnectionHandle::new()
    }

    /// Every frame queued on a connection so far, parsed.
    pub fn received(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }
}
