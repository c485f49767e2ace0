use std::net::SocketAddr;

use axum::{routing::get, Router};
use tracing::{error, info};

use query_devtools_sync::{config::HubConfig, ws_gateway, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = HubConfig::from_env()?;
    let state = AppState::initialize(&config);

    let router = Router::new()
        .route("/ws", get(ws_gateway::ws_handler))
        .route("/devices", get(ws_gateway::devices_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "server failed");
            e
        })?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
