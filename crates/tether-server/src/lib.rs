pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tether_gateway::ChatService;
use tether_gateway::connection;
use tether_gateway::fanout::{DisabledFanout, FanoutChannel, FanoutReceiver, LocalHub};
use tether_gateway::hub::{HubServer, RemoteLink};

use crate::config::TetherConfig;

/// HTTP surface: the chat WebSocket and a health check.
pub fn router(service: ChatService) -> Router {
    Router::new()
        .route("/chat", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(service)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(service): State<ChatService>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, service))
}

async fn health() -> &'static str {
    "ok"
}

/// Pick this instance's fanout link from the config.
///
/// The receiver is `None` in degraded mode, where nothing arrives from the
/// cluster. Only a hub listener that cannot bind is fatal.
pub async fn connect_fanout(
    config: &TetherConfig,
) -> anyhow::Result<(Arc<dyn FanoutChannel>, Option<FanoutReceiver>)> {
    if let Some(listen) = config.hub_listen {
        if config.hub_addr.is_some() {
            warn!("TETHER_HUB_LISTEN is set, ignoring TETHER_HUB_ADDR");
        }
        let hub = LocalHub::new();
        let listener = TcpListener::bind(listen).await?;
        info!("Fanout hub listening on {}", listener.local_addr()?);
        tokio::spawn(HubServer::new(hub.clone()).run(listener));

        let (link, rx) = hub.attach();
        return Ok((Arc::new(link), Some(rx)));
    }

    if let Some(addr) = &config.hub_addr {
        return match RemoteLink::connect(addr.as_str()).await {
            Ok((link, rx)) => Ok((Arc::new(link), Some(rx))),
            Err(e) => {
                warn!("Fanout hub {} unreachable, running without cluster delivery: {}", addr, e);
                Ok((Arc::new(DisabledFanout), None))
            }
        };
    }

    // Single instance: an in-process hub nobody else shares
    let (link, rx) = LocalHub::new().attach();
    Ok((Arc::new(link), Some(rx)))
}

/// Clear presence left over from a crash. Skipped in cluster mode unless
/// asked for, since other instances' users are live.
pub fn sweep_stale_presence(service: &ChatService, config: &TetherConfig) -> anyhow::Result<()> {
    if config.resets_presence_on_start() {
        service.reset()?;
    } else {
        info!("Cluster mode, keeping existing presence");
    }
    Ok(())
}
