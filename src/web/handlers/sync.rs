//! # Sync Handlers
//!
//! Trigger runs, read their status and follow their progress.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::SyncProgress;
use crate::orchestration::{StartSyncRequest, StartSyncResponse, SyncStatusReport};
use crate::web::response_types::{ApiError, ApiResult};
use crate::web::state::AppState;

const DEFAULT_STATUS_LIMIT: i64 = 20;
const MAX_STATUS_LIMIT: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub sync_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// POST /v1/sync
pub async fn start_sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartSyncRequest>,
) -> ApiResult<(StatusCode, Json<StartSyncResponse>)> {
    info!(data_type = %request.data_type, force = request.force_sync, "Sync requested");
    let response = state.service.start_sync(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /v1/sync/status
pub async fn get_sync_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<SyncStatusReport>> {
    let limit = query.limit.unwrap_or(DEFAULT_STATUS_LIMIT);
    if !(1..=MAX_STATUS_LIMIT).contains(&limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_STATUS_LIMIT}"
        )));
    }
    let report = state.service.get_sync_status(query.sync_id, limit).await?;
    Ok(Json(report))
}

/// GET /v1/sync/{sync_id}/progress
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(sync_id): Path<Uuid>,
) -> ApiResult<Json<SyncProgress>> {
    Ok(Json(state.service.get_progress(sync_id).await?))
}

/// GET /v1/sync/progress
pub async fn list_active_progress(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SyncProgress>>> {
    Ok(Json(state.service.list_active_progress().await?))
}

/// GET /v1/sync/progress/stream
///
/// Server-sent `progress` events for every run. A subscriber that falls
/// behind skips the missed updates.
pub async fn stream_progress(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Progress stream subscriber connected");
    let receiver = state.progress.subscribe();

    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(progress) => {
                    let event = Event::default()
                        .event("progress")
                        .json_data(&progress)
                        .unwrap_or_else(|_| Event::default().event("progress").data("{}"));
                    return Some((Ok(event), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
