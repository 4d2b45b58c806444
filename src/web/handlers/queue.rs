//! # Queue and Recovery Handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::models::FailedSyncItem;
use crate::queue::QueueStats;
use crate::web::response_types::{ApiError, ApiResult};
use crate::web::state::AppState;

/// GET /v1/queue/stats
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.service.queue_stats().await?))
}

/// DELETE /v1/queue/jobs/{job_id}
///
/// Only pending jobs can be cancelled; a claimed job runs to completion.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.service.cancel(job_id).await? {
        info!(%job_id, "Job cancelled");
        return Ok(StatusCode::NO_CONTENT);
    }
    match state.service.queue().get(job_id).await? {
        Some(job) => Err(ApiError::Conflict(format!(
            "job {job_id} is {} and cannot be cancelled",
            job.status
        ))),
        None => Err(ApiError::NotFound(format!("job {job_id}"))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FailedItemsQuery {
    pub sync_id: Option<Uuid>,
}

/// GET /v1/recovery/failed-items
pub async fn list_failed_items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedItemsQuery>,
) -> ApiResult<Json<Vec<FailedSyncItem>>> {
    Ok(Json(state.recovery.list_unresolved(query.sync_id).await?))
}
