use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

// Use jemalloc on Linux for reduced fragmentation on long-running processes.
// Other platforms use the system allocator.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use parley_server::{db, routing, ServerConfig, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parley_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting Parley server");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let backend = db::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open storage at {}", config.database_url))?;
    info!("Storage initialized ({})", backend.name());

    let state = Arc::new(ServerState::new(backend, config.clone()));
    if !state.auth.is_enforcing() {
        warn!("PARLEY_AUTH_SECRET not set: announced account ids are trusted (development mode only)");
    }

    let app = routing::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("Server stopped cleanly");
    Ok(())
}
