use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::registry::ConnectionHandle;
use crate::service::ChatService;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one client socket until either side goes away.
///
/// Connections start anonymous; a login frame binds the handle to a user in
/// the registry. Whatever happens, the handle is released on exit.
pub async fn handle_connection(socket: WebSocket, service: ChatService) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = ConnectionHandle::new();
    info!(conn = %conn.id(), "Client connected");

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outbound frames + heartbeat -> client
    let send_conn = conn.id();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(text) = frame else { break };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(conn = %send_conn, "Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client frames -> dispatch
    let recv_service = service.clone();
    let recv_conn = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    recv_service.dispatch_text(&recv_conn, text.as_str(), Utc::now());
                }
                Message::Binary(data) => {
                    debug!(conn = %recv_conn.id(), "Ignoring {} byte binary frame", data.len());
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    service.handle_disconnect(&conn);
    info!(conn = %conn.id(), "Client disconnected");
}
