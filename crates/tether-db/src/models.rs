/// Database row types. These map directly to SQLite rows.
/// Converted into tether-types models at the query boundary.
use anyhow::Result;
use tether_types::models::{Account, GroupMember, GroupRole, Presence, User};

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub password: String,
    pub state: String,
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            name: self.name,
            presence: self.state.parse::<Presence>()?,
        })
    }

    pub fn into_account(self) -> Result<Account> {
        let password_hash = self.password.clone();
        Ok(Account {
            user: self.into_user()?,
            password_hash,
        })
    }
}

pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub description: String,
}

pub struct GroupMemberRow {
    pub group_id: i64,
    pub user: UserRow,
    pub role: String,
}

impl GroupMemberRow {
    pub fn into_member(self) -> Result<GroupMember> {
        Ok(GroupMember {
            role: self.role.parse::<GroupRole>()?,
            user: self.user.into_user()?,
        })
    }
}
