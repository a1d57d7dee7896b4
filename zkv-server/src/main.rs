//! zkv-server binary entry point.
//!
//! Usage:
//! ```bash
//! zkv-server --config zkv.toml
//! ```
//!
//! Runs the HTTP surface (health, metrics) and the seed-request cleanup
//! task. The websocket accept layer attaches through
//! [`zkv_server::server::SyncServer::register`].

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zkv_server::cleanup::spawn_cleanup_task;
use zkv_server::config::Config;
use zkv_server::http;
use zkv_server::server::SyncServer;
use zkv_server::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = get_config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        tracing::info!("no config at {}, using defaults", config_path.display());
        Config::default()
    };

    let store = Arc::new(
        SqliteStore::new(&config.storage.database)
            .await
            .context("opening storage")?,
    );

    let server = SyncServer::new(config.clone(), store.clone(), store.clone(), store.clone());

    http::health::init_start_time();
    let cleanup = spawn_cleanup_task(store, config.cleanup.clone());

    let listener = tokio::net::TcpListener::bind(&config.http.bind_address)
        .await
        .with_context(|| format!("binding http on {}", config.http.bind_address))?;
    tracing::info!("zkv-server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("http listening on {}", config.http.bind_address);

    let router = http::build_router(server);

    tokio::select! {
        result = axum::serve(listener, router) => {
            result.context("http server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    cleanup.abort();
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("zkv.toml"))
}
