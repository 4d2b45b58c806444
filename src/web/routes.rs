//! Route definitions grouped by concern.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::web::{handlers, state::AppState};

/// Liveness and dependency health
pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/health/detailed",
            get(handlers::health::detailed_health_check),
        )
}

/// Triggering, status and progress of sync runs
pub fn sync_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/sync", post(handlers::sync::start_sync))
        .route("/v1/sync/status", get(handlers::sync::get_sync_status))
        .route("/v1/sync/progress", get(handlers::sync::list_active_progress))
        .route(
            "/v1/sync/progress/stream",
            get(handlers::sync::stream_progress),
        )
        .route(
            "/v1/sync/{sync_id}/progress",
            get(handlers::sync::get_progress),
        )
}

pub fn queue_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/queue/stats", get(handlers::queue::queue_stats))
        .route("/v1/queue/jobs/{job_id}", delete(handlers::queue::cancel_job))
        .route(
            "/v1/recovery/failed-items",
            get(handlers::queue::list_failed_items),
        )
}
