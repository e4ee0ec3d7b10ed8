//! `quire-relay`: hosts document rooms for collaborative editing.
//!
//! Environment:
//! - `QUIRE_BIND`: listen address (default `127.0.0.1:9090`)
//! - `QUIRE_DATA_DIR`: RocksDB directory for room snapshots (unset = memory only)
//! - `RUST_LOG`: log filter, read by `env_logger`

use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};
use quire_collab::{RelayServer, ServerConfig};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("QUIRE_BIND") {
        config.bind_addr = bind;
    }
    config.storage_path = std::env::var_os("QUIRE_DATA_DIR").map(PathBuf::from);
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = config_from_env();
    info!("Starting Quire relay on {}...", config.bind_addr);

    let server = match RelayServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open relay storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    let persisted = server.persist_dirty_rooms().await;
    if persisted > 0 {
        info!("Persisted {persisted} room(s) before exit");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Relay stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
