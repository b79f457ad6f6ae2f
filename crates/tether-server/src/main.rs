use std::sync::Arc;

use tracing::info;

use tether_db::Database;
use tether_gateway::ChatService;
use tether_gateway::fanout::spawn_delivery;
use tether_server::config::TetherConfig;
use tether_server::{connect_fanout, router, sweep_stale_presence};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_server=debug,tether_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = TetherConfig::from_env();

    // Init database
    let db = Database::open(&config.db_path)?;

    let (fanout, inbound) = connect_fanout(&config).await?;
    let service = ChatService::new(Arc::new(db), fanout);
    if let Some(rx) = inbound {
        spawn_delivery(service.clone(), rx);
    }

    sweep_stale_presence(&service, &config)?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Tether server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    service.release_local();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
