use std::collections::HashMap;

use crate::models::{GroupMemberRow, GroupRow, UserRow};
use crate::Database;
use anyhow::{Result, anyhow, bail};
use rusqlite::{Connection, Row};
use tether_types::models::{GroupRole, Presence};

impl Database {
    // -- Users --

    /// Insert a new user and return the assigned id. Fails on a duplicate name.
    pub fn create_user(&self, name: &str, password_hash: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (name, password) VALUES (?1, ?2)",
                (name, password_hash),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    pub fn set_user_state(&self, id: i64, presence: Presence) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET state = ?1 WHERE id = ?2",
                (presence.as_str(), id),
            )?;
            if changed == 0 {
                bail!("User not found: {}", id);
            }
            Ok(())
        })
    }

    /// Mark every user offline. Returns how many rows were online.
    pub fn reset_all_states(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET state = 'offline' WHERE state = 'online'",
                [],
            )?;
            Ok(changed)
        })
    }

    // -- Friends --

    /// Record a friendship. Adding an existing edge (in either direction) is a no-op.
    pub fn add_friend(&self, user_id: i64, friend_id: i64) -> Result<()> {
        if user_id == friend_id {
            bail!("User {} cannot befriend themselves", user_id);
        }
        let (low, high) = (user_id.min(friend_id), user_id.max(friend_id));
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO friends (user_id, friend_id) VALUES (?1, ?2)",
                (low, high),
            )?;
            Ok(())
        })
    }

    pub fn get_friends(&self, user_id: i64) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.name, u.password, u.state
                 FROM users u
                 JOIN friends f ON (f.friend_id = u.id AND f.user_id = ?1)
                                OR (f.user_id = u.id AND f.friend_id = ?1)
                 ORDER BY u.id",
            )?;

            let rows = stmt
                .query_map([user_id], user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Groups --

    pub fn create_group(&self, name: &str, description: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_groups (name, description) VALUES (?1, ?2)",
                (name, description),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Add a member. Re-joining keeps the existing role.
    pub fn add_group_member(&self, group_id: i64, user_id: i64, role: GroupRole) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, role) VALUES (?1, ?2, ?3)",
                rusqlite::params![group_id, user_id, role.as_str()],
            )?;
            Ok(())
        })
    }

    /// Every group `user_id` belongs to, each with its full member list.
    pub fn get_groups_for_user(&self, user_id: i64) -> Result<Vec<(GroupRow, Vec<GroupMemberRow>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.description
                 FROM chat_groups g
                 JOIN group_members gm ON gm.group_id = g.id
                 WHERE gm.user_id = ?1
                 ORDER BY g.id",
            )?;
            let groups = stmt
                .query_map([user_id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            // Members of all those groups in one query (no N+1)
            let mut stmt = conn.prepare(
                "SELECT gm.group_id, u.id, u.name, u.password, u.state, gm.role
                 FROM group_members gm
                 JOIN users u ON u.id = gm.user_id
                 WHERE gm.group_id IN (SELECT group_id FROM group_members WHERE user_id = ?1)
                 ORDER BY gm.group_id, gm.rowid",
            )?;
            let members = stmt
                .query_map([user_id], |row| {
                    Ok(GroupMemberRow {
                        group_id: row.get(0)?,
                        user: UserRow {
                            id: row.get(1)?,
                            name: row.get(2)?,
                            password: row.get(3)?,
                            state: row.get(4)?,
                        },
                        role: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut by_group: HashMap<i64, Vec<GroupMemberRow>> = HashMap::new();
            for member in members {
                by_group.entry(member.group_id).or_default().push(member);
            }

            let result = groups
                .into_iter()
                .map(|group| {
                    let members = by_group.remove(&group.id).unwrap_or_default();
                    (group, members)
                })
                .collect();

            Ok(result)
        })
    }

    pub fn get_group_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY rowid",
            )?;
            let ids = stmt
                .query_map([group_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }

    // -- Offline queue --

    pub fn enqueue_offline(&self, user_id: i64, payload: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO offline_messages (user_id, payload) VALUES (?1, ?2)",
                (user_id, payload),
            )?;
            Ok(())
        })
    }

    /// Return all queued payloads for `user_id` in enqueue order and delete them,
    /// atomically.
    pub fn drain_offline(&self, user_id: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let payloads = {
                let mut stmt = tx.prepare(
                    "SELECT payload FROM offline_messages WHERE user_id = ?1 ORDER BY seq",
                )?;
                stmt.query_map([user_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?
            };
            tx.execute("DELETE FROM offline_messages WHERE user_id = ?1", [user_id])?;
            tx.commit()?;
            Ok(payloads)
        })
    }

    pub fn count_offline(&self, user_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM offline_messages WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            usize::try_from(count).map_err(|e| anyhow!("bad count {}: {}", count, e))
        })
    }
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        password: row.get(2)?,
        state: row.get(3)?,
    })
}

fn query_user<P: rusqlite::ToSql>(conn: &Connection, filter: &str, value: P) -> Result<Option<UserRow>> {
    let sql = format!("SELECT id, name, password, state FROM users WHERE {}", filter);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt.query_row([value], user_row).optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
