//! Handlers for each client request kind, as registered in
//! [`DispatchTable::standard`](crate::dispatcher::DispatchTable::standard).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use tether_types::messages::{
    AddFriendRequest, AddGroupRequest, CreateGroupRequest, GroupChatRequest, LoginAck,
    LoginRequest, LogoutRequest, MsgKind, OneChatRequest, RegisterAck, RegisterRequest,
};
use tether_types::models::GroupRole;

use crate::error::ChatError;
use crate::registry::ConnectionHandle;
use crate::service::ChatService;

fn parse<T: DeserializeOwned>(kind: MsgKind, frame: &Value) -> Result<T, ChatError> {
    T::deserialize(frame).map_err(|e| ChatError::malformed(kind, e))
}

pub fn login(
    service: &ChatService,
    conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: LoginRequest = parse(MsgKind::Login, frame)?;
    let ack = match service.login(conn, req.id, &req.password) {
        Ok(ack) => ack,
        Err(e) => LoginAck::failure(e.errno(), e.to_string()),
    };
    conn.send_json(&ack)?;
    Ok(())
}

pub fn logout(
    service: &ChatService,
    _conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: LogoutRequest = parse(MsgKind::Logout, frame)?;
    service.logout(req.id);
    Ok(())
}

pub fn register(
    service: &ChatService,
    conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: RegisterRequest = parse(MsgKind::Register, frame)?;
    let ack = match service.register(&req.name, &req.password) {
        Ok(id) => RegisterAck::success(id),
        Err(e) => RegisterAck::failure(e.errno()),
    };
    conn.send_json(&ack)?;
    Ok(())
}

pub fn one_chat(
    service: &ChatService,
    _conn: &ConnectionHandle,
    frame: &Value,
    received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: OneChatRequest = parse(MsgKind::OneChat, frame)?;
    let delivery = service.deliver(req.toid, &frame.to_string())?;
    debug!(
        to = req.toid,
        ?delivery,
        latency_ms = (Utc::now() - received_at).num_milliseconds(),
        "Chat message routed"
    );
    Ok(())
}

pub fn add_friend(
    service: &ChatService,
    _conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: AddFriendRequest = parse(MsgKind::AddFriend, frame)?;
    service
        .store()
        .insert_friend_edge(req.id, req.friend_id)
        .map_err(ChatError::store)?;
    info!(user_id = req.id, friend_id = req.friend_id, "Friend added");
    Ok(())
}

pub fn create_group(
    service: &ChatService,
    _conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: CreateGroupRequest = parse(MsgKind::CreateGroup, frame)?;
    let store = service.store();
    let group_id = store
        .create_group(&req.name, &req.description)
        .map_err(ChatError::store)?;
    store
        .add_group_member(group_id, req.id, GroupRole::Creator)
        .map_err(ChatError::store)?;
    info!(user_id = req.id, group_id, "Group {} created", req.name);
    Ok(())
}

pub fn add_group(
    service: &ChatService,
    _conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: AddGroupRequest = parse(MsgKind::AddGroup, frame)?;
    service
        .store()
        .add_group_member(req.group_id, req.id, GroupRole::Normal)
        .map_err(ChatError::store)?;
    info!(user_id = req.id, group_id = req.group_id, "Joined group");
    Ok(())
}

pub fn group_chat(
    service: &ChatService,
    _conn: &ConnectionHandle,
    frame: &Value,
    _received_at: DateTime<Utc>,
) -> Result<(), ChatError> {
    let req: GroupChatRequest = parse(MsgKind::GroupChat, frame)?;
    let members = service
        .store()
        .query_group_member_ids(req.group_id)
        .map_err(ChatError::store)?;

    let payload = frame.to_string();
    for member in members.into_iter().filter(|&m| m != req.id) {
        if let Err(e) = service.deliver(member, &payload) {
            warn!(group_id = req.group_id, user_id = member, "Group message not delivered: {}", e);
        }
    }
    Ok(())
}
