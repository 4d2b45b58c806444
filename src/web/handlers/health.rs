//! # Health Check Handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DatastoreBackend;
use crate::models::RateLimitRecord;
use crate::queue::QueueStats;
use crate::resilience::SystemCircuitBreakerMetrics;
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub timestamp: String,
    pub backend: DatastoreBackend,
    pub database_pool_size: Option<u32>,
    pub circuit_breakers: SystemCircuitBreakerMetrics,
    pub rate_limits: Vec<RateLimitRecord>,
    /// Absent when the queue store could not be read
    pub queue: Option<QueueStats>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /health/detailed
///
/// Reports `degraded` with a 503 while any circuit is open or the queue
/// store is unreachable.
pub async fn detailed_health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<DetailedHealthResponse>) {
    debug!("Performing detailed health check");

    let circuit_breakers = state.breakers.system_metrics();
    let queue = match state.service.queue_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "Queue stats unavailable during health check");
            None
        }
    };

    let healthy = circuit_breakers.open_circuits == 0 && queue.is_some();
    let (status_code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let response = DetailedHealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        backend: state.backend,
        database_pool_size: state.pool.as_ref().map(|p| p.size()),
        circuit_breakers,
        rate_limits: state.rate_limits.snapshot(),
        queue,
    };
    (status_code, Json(response))
}
