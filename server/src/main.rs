use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

// Use jemalloc on Linux for reduced fragmentation on long-running relay
// processes holding large transfer buffers. On Windows/macOS the default
// system allocator is used instead.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use beamdrop_server::config::ServerConfig;
use beamdrop_server::registry::DeviceRegistry;
use beamdrop_server::rooms::RoomRegistry;
use beamdrop_server::websocket::ServerState;
use beamdrop_server::{janitor, routing, store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("beamdrop_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting beamdrop relay");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let data_dir = PathBuf::from(&config.data_dir);
    let (device_catalog, room_catalog) = store::load(&data_dir).await;
    info!(
        devices = device_catalog.len(),
        rooms = room_catalog.len(),
        "Catalog loaded"
    );

    let devices = Arc::new(DeviceRegistry::new(device_catalog));
    let rooms = Arc::new(RoomRegistry::new(room_catalog));
    let store = store::spawn_writer(data_dir.clone(), devices.clone(), rooms.clone());

    tokio::fs::create_dir_all(&config.upload_dir).await.ok();

    let state = Arc::new(ServerState::new(
        config.clone(),
        devices.clone(),
        rooms.clone(),
        store,
    ));

    janitor::spawn(state.clone());
    info!("Janitor started");

    let app = routing::create_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Graceful shutdown signal (cross-platform)
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

    // Normal-closure to every channel, then a short grace for the frames
    // to drain before the final flush.
    state.close_all_channels().await;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    info!("Flushing catalog...");
    if let Err(e) = store::write_snapshot(&data_dir, &devices, &rooms).await {
        warn!("Final catalog flush failed: {}", e);
    }

    info!("Server stopped cleanly");
    Ok(())
}
