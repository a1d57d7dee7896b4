//! HTTP endpoints for zkv-server.
//!
//! Provides health checks and metrics.

pub mod health;
mod metrics;

use crate::server::SyncServer;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(server))
}
