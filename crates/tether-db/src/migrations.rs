use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            state       TEXT NOT NULL DEFAULT 'offline'
                        CHECK (state IN ('online', 'offline')),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Unordered pair, stored with user_id < friend_id
        CREATE TABLE IF NOT EXISTS friends (
            user_id     INTEGER NOT NULL REFERENCES users(id),
            friend_id   INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, friend_id),
            CHECK (user_id < friend_id)
        );

        CREATE INDEX IF NOT EXISTS idx_friends_friend
            ON friends(friend_id);

        CREATE TABLE IF NOT EXISTS chat_groups (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    INTEGER NOT NULL REFERENCES chat_groups(id),
            user_id     INTEGER NOT NULL REFERENCES users(id),
            role        TEXT NOT NULL CHECK (role IN ('creator', 'normal')),
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);

        -- No foreign key: messages may be queued for ids we have never seen
        CREATE TABLE IF NOT EXISTS offline_messages (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL,
            payload     TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_offline_messages_user
            ON offline_messages(user_id, seq);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
