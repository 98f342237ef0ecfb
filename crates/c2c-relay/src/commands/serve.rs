//! Relay server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use c2c_relay::config::{self, Config, StorageBackend, StorageConfig};
use c2c_relay::middleware::SessionFactory;
use c2c_relay::server::RelayServer;
use c2c_relay::session::ConnectionCache;
use c2c_relay::store::{FileBucketStore, RelayStorage};

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("loading {config_path}"))?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let storage = open_storage(Path::new(config_path), &config.storage);
    let factory = SessionFactory::new(&config.relay, ConnectionCache::new(), storage);
    info!(
        client_type = config.relay.client_type(),
        middleware = ?config.relay.middleware(),
        "Relay configured"
    );

    let ip: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid host '{}'", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let server = RelayServer::new(factory, config.server.read_timeout());
    tokio::spawn(shutdown_signal(server.shutdown_token()));

    server.serve(listener).await?;
    info!("Server stopped");
    Ok(())
}

fn open_storage(config_path: &Path, storage: &StorageConfig) -> RelayStorage {
    match storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            RelayStorage::in_memory()
        }
        StorageBackend::File => {
            let raw = storage
                .path
                .as_deref()
                .unwrap_or(Path::new(config::DEFAULT_STORAGE_DIR));
            let root = config::resolve_path(config_path, raw);
            info!(path = %root.display(), "Using file storage");
            RelayStorage::new(Arc::new(FileBucketStore::new(root)))
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
    shutdown.cancel();
}
