//! Scribe sync server.
//!
//! Reads `SCRIBE_*` / `SCRIBE_ROOM_*` settings (optionally from a `.env`
//! file), serves rooms over WebSocket and flushes every dirty room on Ctrl-C.

use std::sync::Arc;

use log::{error, info};
use scribe_collab::access::AllowAll;
use scribe_collab::config::ServerConfig;
use scribe_collab::server::SyncServer;
use scribe_collab::storage::{FileStorage, MemoryStorage, RocksConfig, RocksStorage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;

    let storage: Arc<dyn FileStorage> = match &config.storage_path {
        Some(path) => {
            info!("Using RocksDB storage at {}", path.display());
            Arc::new(RocksStorage::open(RocksConfig::new(path.clone()))?)
        }
        None => {
            info!("No SCRIBE_STORAGE_PATH set, snapshots are kept in memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let server = SyncServer::new(config, storage, Arc::new(AllowAll));

    let outcome = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            Ok(())
        }
    };
    if let Err(e) = &outcome {
        error!("Sync server stopped: {e}");
    }

    let summary = server.shutdown().await;
    info!(
        "Flushed {} rooms ({} clean, {} failed)",
        summary.written, summary.clean, summary.failed
    );
    outcome?;
    Ok(())
}
