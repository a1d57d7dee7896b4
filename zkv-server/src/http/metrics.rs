//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();

    // Gauges — current state
    let connections = server.registry().total_connections();
    let users = server.registry().total_users();

    // Counters — monotonic since startup
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let pushes = m.pushes_total.load(Ordering::Relaxed);
    let fast_path = m.fast_path_sends.load(Ordering::Relaxed);
    let delivered = m.transactions_delivered.load(Ordering::Relaxed);
    let rollbacks = m.rollbacks_written.load(Ordering::Relaxed);
    let bundle_hints = m.bundle_hints.load(Ordering::Relaxed);
    let seed_requests = m.seed_requests_routed.load(Ordering::Relaxed);
    let seeds = m.seeds_delivered.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP zkv_server_connections_active Number of active connections
# TYPE zkv_server_connections_active gauge
zkv_server_connections_active {connections}

# HELP zkv_server_users_active Number of users with active connections
# TYPE zkv_server_users_active gauge
zkv_server_users_active {users}

# HELP zkv_server_info Server information
# TYPE zkv_server_info gauge
zkv_server_info{{version="{version}"}} 1

# HELP zkv_server_connections_total Total connections accepted
# TYPE zkv_server_connections_total counter
zkv_server_connections_total {conns_total}

# HELP zkv_server_pushes_total Total push pipeline runs
# TYPE zkv_server_pushes_total counter
zkv_server_pushes_total {pushes}

# HELP zkv_server_fast_path_sends_total Total fan-out sends with no store read
# TYPE zkv_server_fast_path_sends_total counter
zkv_server_fast_path_sends_total {fast_path}

# HELP zkv_server_transactions_delivered_total Total transactions delivered
# TYPE zkv_server_transactions_delivered_total counter
zkv_server_transactions_delivered_total {delivered}

# HELP zkv_server_rollbacks_written_total Total rollback sentinels written
# TYPE zkv_server_rollbacks_written_total counter
zkv_server_rollbacks_written_total {rollbacks}

# HELP zkv_server_bundle_hints_total Total batches carrying the compaction hint
# TYPE zkv_server_bundle_hints_total counter
zkv_server_bundle_hints_total {bundle_hints}

# HELP zkv_server_seed_requests_total Total seed requests routed
# TYPE zkv_server_seed_requests_total counter
zkv_server_seed_requests_total {seed_requests}

# HELP zkv_server_seeds_delivered_total Total seeds delivered to requesters
# TYPE zkv_server_seeds_delivered_total counter
zkv_server_seeds_delivered_total {seeds}

# HELP zkv_server_rate_limit_hits_total Total rate limit rejections
# TYPE zkv_server_rate_limit_hits_total counter
zkv_server_rate_limit_hits_total {rate_limits}

# HELP zkv_server_errors_total Total errors absorbed at the fan-out boundary
# TYPE zkv_server_errors_total counter
zkv_server_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
