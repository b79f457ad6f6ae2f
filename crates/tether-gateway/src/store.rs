//! Durable records the core reads and writes: users, friends, groups and the
//! offline queue.
//!
//! Implementations must be safe to call from any task and are expected to
//! return within a bounded time. Callers never hold the registry lock across
//! these calls.

use anyhow::Result;

use tether_db::Database;
use tether_types::models::{Account, Group, GroupId, GroupRole, Presence, User, UserId};

pub trait RecipientStore: Send + Sync {
    fn query_user(&self, id: UserId) -> Result<Option<Account>>;
    /// Returns the assigned id. Fails if the name is taken.
    fn insert_user(&self, name: &str, password_hash: &str) -> Result<UserId>;
    fn update_presence(&self, id: UserId, presence: Presence) -> Result<()>;
    /// Returns how many users were flipped from online to offline.
    fn reset_all_presence_offline(&self) -> Result<usize>;

    fn query_friends(&self, id: UserId) -> Result<Vec<User>>;
    fn insert_friend_edge(&self, a: UserId, b: UserId) -> Result<()>;

    fn create_group(&self, name: &str, description: &str) -> Result<GroupId>;
    fn add_group_member(&self, group_id: GroupId, user_id: UserId, role: GroupRole) -> Result<()>;
    fn query_groups_for_user(&self, id: UserId) -> Result<Vec<Group>>;
    fn query_group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>>;

    fn enqueue_offline(&self, id: UserId, payload: &str) -> Result<()>;
    /// Queued payloads in enqueue order. The queue is empty afterwards.
    fn drain_offline(&self, id: UserId) -> Result<Vec<String>>;
}

impl RecipientStore for Database {
    fn query_user(&self, id: UserId) -> Result<Option<Account>> {
        self.get_user(id)?.map(|row| row.into_account()).transpose()
    }

    fn insert_user(&self, name: &str, password_hash: &str) -> Result<UserId> {
        self.create_user(name, password_hash)
    }

    fn update_presence(&self, id: UserId, presence: Presence) -> Result<()> {
        self.set_user_state(id, presence)
    }

    fn reset_all_presence_offline(&self) -> Result<usize> {
        self.reset_all_states()
    }

    fn query_friends(&self, id: UserId) -> Result<Vec<User>> {
        self.get_friends(id)?
            .into_iter()
            .map(|row| row.into_user())
            .collect()
    }

    fn insert_friend_edge(&self, a: UserId, b: UserId) -> Result<()> {
        self.add_friend(a, b)
    }

    fn create_group(&self, name: &str, description: &str) -> Result<GroupId> {
        Database::create_group(self, name, description)
    }

    fn add_group_member(&self, group_id: GroupId, user_id: UserId, role: GroupRole) -> Result<()> {
        Database::add_group_member(self, group_id, user_id, role)
    }

    fn query_groups_for_user(&self, id: UserId) -> Result<Vec<Group>> {
        self.get_groups_for_user(id)?
            .into_iter()
            .map(|(group, members)| {
                Ok(Group {
                    id: group.id,
                    name: group.name,
                    description: group.description,
                    members: members
                        .into_iter()
                        .map(|m| m.into_member())
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect()
    }

    fn query_group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        self.get_group_member_ids(group_id)
    }

    fn enqueue_offline(&self, id: UserId, payload: &str) -> Result<()> {
        Database::enqueue_offline(self, id, payload)
    }

    fn drain_offline(&self, id: UserId) -> Result<Vec<String>> {
        Database::drain_offline(self, id)
    }
}
