use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{Group, GroupId, GroupRole, Presence, User, UserId};

/// Discriminator carried in the `msgid` field of every frame.
///
/// The numeric values are part of the wire protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum MsgKind {
    Login = 1,
    LoginAck = 2,
    Logout = 3,
    Register = 4,
    RegisterAck = 5,
    OneChat = 6,
    AddFriend = 7,
    CreateGroup = 8,
    AddGroup = 9,
    GroupChat = 10,
}

impl MsgKind {
    pub const ALL: [MsgKind; 10] = [
        Self::Login,
        Self::LoginAck,
        Self::Logout,
        Self::Register,
        Self::RegisterAck,
        Self::OneChat,
        Self::AddFriend,
        Self::CreateGroup,
        Self::AddGroup,
        Self::GroupChat,
    ];

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn id(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.id())
    }
}

impl Serialize for MsgKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.id())
    }
}

impl<'de> Deserialize<'de> for MsgKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = i64::deserialize(deserializer)?;
        MsgKind::from_id(id).ok_or_else(|| serde::de::Error::custom(format!("unknown msgid {}", id)))
    }
}

/// Read the `msgid` tag of a decoded frame without interpreting the rest.
pub fn msgid_of(frame: &serde_json::Value) -> Option<i64> {
    frame.get("msgid").and_then(serde_json::Value::as_i64)
}

// -- Errno --

pub const ERRNO_OK: i32 = 0;
pub const ERRNO_INVALID_CREDENTIAL: i32 = 1;
pub const ERRNO_DUPLICATE_SESSION: i32 = 2;
pub const ERRNO_REGISTRATION_FAILED: i32 = 3;

// -- Requests --
//
// Unknown fields are tolerated: chat frames carry free-form content that is
// forwarded verbatim.

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub id: UserId,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct OneChatRequest {
    pub toid: UserId,
}

#[derive(Debug, Deserialize)]
pub struct AddFriendRequest {
    pub id: UserId,
    #[serde(rename = "friendid")]
    pub friend_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub id: UserId,
    #[serde(rename = "groupname")]
    pub name: String,
    #[serde(rename = "groupdesc", default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct AddGroupRequest {
    pub id: UserId,
    #[serde(rename = "groupid")]
    pub group_id: GroupId,
}

#[derive(Debug, Deserialize)]
pub struct GroupChatRequest {
    pub id: UserId,
    #[serde(rename = "groupid")]
    pub group_id: GroupId,
}

// -- Responses --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEntry {
    pub id: UserId,
    pub name: String,
    pub state: Presence,
}

impl From<&User> for FriendEntry {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            state: user.presence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUserEntry {
    pub id: UserId,
    pub name: String,
    pub state: Presence,
    pub role: GroupRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: GroupId,
    #[serde(rename = "groupname")]
    pub name: String,
    #[serde(rename = "groupdesc")]
    pub description: String,
    pub users: Vec<GroupUserEntry>,
}

impl From<&Group> for GroupEntry {
    fn from(group: &Group) -> Self {
        Self {
            id: group.id,
            name: group.name.clone(),
            description: group.description.clone(),
            users: group
                .members
                .iter()
                .map(|m| GroupUserEntry {
                    id: m.user.id,
                    name: m.user.name.clone(),
                    state: m.user.presence,
                    role: m.role,
                })
                .collect(),
        }
    }
}

/// Reply to a login request. Everything a client needs to resume a session
/// arrives in this one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAck {
    pub msgid: MsgKind,
    pub errno: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Queued payloads in enqueue order.
    #[serde(rename = "offlinemsg", default, skip_serializing_if = "Vec::is_empty")]
    pub offline_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub friends: Vec<FriendEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupEntry>,
}

impl LoginAck {
    pub fn success(
        user: &User,
        offline_messages: Vec<String>,
        friends: &[User],
        groups: &[Group],
    ) -> Self {
        Self {
            msgid: MsgKind::LoginAck,
            errno: ERRNO_OK,
            errmsg: None,
            id: Some(user.id),
            name: Some(user.name.clone()),
            offline_messages,
            friends: friends.iter().map(FriendEntry::from).collect(),
            groups: groups.iter().map(GroupEntry::from).collect(),
        }
    }

    pub fn failure(errno: i32, errmsg: impl Into<String>) -> Self {
        Self {
            msgid: MsgKind::LoginAck,
            errno,
            errmsg: Some(errmsg.into()),
            id: None,
            name: None,
            offline_messages: Vec::new(),
            friends: Vec::new(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub msgid: MsgKind,
    pub errno: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
}

impl RegisterAck {
    pub fn success(id: UserId) -> Self {
        Self {
            msgid: MsgKind::RegisterAck,
            errno: ERRNO_OK,
            id: Some(id),
        }
    }

    pub fn failure(errno: i32) -> Self {
        Self {
            msgid: MsgKind::RegisterAck,
            errno,
            id: None,
        }
    }
}
