//! Operations behind the status interface: trigger a sync, report on runs,
//! read progress. Triggering only enqueues; workers do the syncing.

use crate::clock::Clock;
use crate::datastore::SyncHistoryStore;
use crate::error::{Result, SyncError};
use crate::models::{DataType, SyncPeriod, SyncProgress, SyncRunRecord};
use crate::orchestration::handler::SyncJobPayload;
use crate::progress::ProgressTracker;
use crate::queue::{job_types, JobQueue, JobStatus, NewSyncJob, QueueStats, SyncJob, DEFAULT_SCOPE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Manual trigger; `data_type` is merchants, residuals, volumes, all,
/// historical or daily
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSyncRequest {
    pub data_type: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub force_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSyncResponse {
    pub sync_id: Uuid,
    pub status: String,
}

/// One entry in the status listing. Queued jobs that have not started a run
/// yet appear with their job status only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusEntry {
    pub sync_id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: serde_json::Value,
    pub errors: Vec<String>,
}

impl From<SyncRunRecord> for SyncStatusEntry {
    fn from(run: SyncRunRecord) -> Self {
        Self {
            sync_id: run.sync_id,
            sync_type: run.sync_type,
            status: run.status.to_string(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            stats: run.stats,
            errors: run.errors,
        }
    }
}

impl From<SyncJob> for SyncStatusEntry {
    fn from(job: SyncJob) -> Self {
        let status = match job.status {
            JobStatus::Pending => "queued".to_string(),
            other => other.to_string(),
        };
        Self {
            sync_id: job.id,
            sync_type: job.job_type,
            status,
            started_at: job.created_at,
            completed_at: job.processed_at,
            stats: json!({ "attempts": job.attempts, "scope": job.sync_scope }),
            errors: job.last_error.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub syncs: Vec<SyncStatusEntry>,
    pub queue: QueueStats,
}

pub struct SyncService {
    queue: Arc<JobQueue>,
    history: Arc<dyn SyncHistoryStore>,
    progress: Arc<ProgressTracker>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService").finish_non_exhaustive()
    }
}

impl SyncService {
    pub fn new(
        queue: Arc<JobQueue>,
        history: Arc<dyn SyncHistoryStore>,
        progress: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            history,
            progress,
            clock,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Normalize the job type and resolve the period the run will sync, so
    /// the job scope names the month actually touched
    fn validate(&self, request: &StartSyncRequest) -> Result<(String, Option<SyncPeriod>)> {
        let job_type = request.data_type.trim().to_ascii_lowercase();
        let whole_run = matches!(job_type.as_str(), job_types::HISTORICAL | job_types::DAILY);
        if !whole_run {
            // Normalizes aliases such as "transactions"
            let data_type = DataType::from_str(&job_type)?;
            let period = SyncJobPayload {
                year: request.year,
                month: request.month,
                force: request.force_sync,
            }
            .period()?;
            let current = SyncPeriod::containing(self.clock.now());
            let period = match (period, data_type) {
                (Some(period), _) => Some(period),
                // Residuals for the running month are not published yet
                (None, DataType::Residuals) => Some(current.previous()),
                (None, DataType::Volumes) => Some(current),
                (None, DataType::Merchants | DataType::All) => None,
            };
            return Ok((data_type.as_str().to_string(), period));
        }
        if request.year.is_some() || request.month.is_some() {
            return Err(SyncError::validation(format!(
                "{job_type} sync does not take a year or month"
            )));
        }
        Ok((job_type, None))
    }

    /// Queue a sync. Without `force_sync` a second request for the same type
    /// and scope is rejected while the first is pending or running.
    pub async fn start_sync(&self, request: StartSyncRequest) -> Result<StartSyncResponse> {
        let (job_type, period) = self.validate(&request)?;
        let scope = period
            .map(|p| p.to_string())
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());

        let payload = serde_json::to_value(SyncJobPayload {
            year: period.map(|p| p.year),
            month: period.map(|p| p.month),
            force: request.force_sync,
        })
        .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let job = NewSyncJob::new(job_type.clone())
            .with_scope(scope.clone())
            .with_priority(self.queue.settings().default_priority)
            .with_payload(payload);

        let sync_id = if request.force_sync {
            self.queue.enqueue(job).await?
        } else {
            self.queue.enqueue_exclusive(job).await?
        };

        info!(sync_id = %sync_id, job_type = %job_type, scope = %scope, force = request.force_sync, "Sync queued");
        Ok(StartSyncResponse {
            sync_id,
            status: "queued".to_string(),
        })
    }

    /// Recent runs, newest first; with `sync_id`, just that one
    pub async fn get_sync_status(&self, sync_id: Option<Uuid>, limit: i64) -> Result<SyncStatusReport> {
        let queue = self.queue.stats().await?;

        if let Some(id) = sync_id {
            let entry = match self.history.get_run(id).await? {
                Some(run) => SyncStatusEntry::from(run),
                None => self
                    .queue
                    .get(id)
                    .await?
                    .map(SyncStatusEntry::from)
                    .ok_or_else(|| SyncError::NotFound(format!("sync {id}")))?,
            };
            return Ok(SyncStatusReport {
                syncs: vec![entry],
                queue,
            });
        }

        let runs = self.history.list_runs(limit).await?;
        let mut syncs: Vec<SyncStatusEntry> = runs.into_iter().map(SyncStatusEntry::from).collect();
        for job in self.queue.list_recent(limit).await? {
            if !syncs.iter().any(|s| s.sync_id == job.id) {
                syncs.push(job.into());
            }
        }
        syncs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        syncs.truncate(usize::try_from(limit.max(0)).unwrap_or(0));

        Ok(SyncStatusReport { syncs, queue })
    }

    pub async fn get_progress(&self, sync_id: Uuid) -> Result<SyncProgress> {
        self.progress
            .get_progress(sync_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("no progress for sync {sync_id}")))
    }

    pub async fn list_active_progress(&self) -> Result<Vec<SyncProgress>> {
        self.progress.list_active().await
    }

    pub async fn cancel(&self, sync_id: Uuid) -> Result<bool> {
        self.queue.cancel(sync_id).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestHarness;

    fn request(data_type: &str) -> StartSyncRequest {
        StartSyncRequest {
            data_type: data_type.into(),
            year: None,
            month: None,
            force_sync: false,
        }
    }

    #[tokio::test]
    async fn test_overlapping_trigger_rejected_unless_forced() {
        let harness = TestHarness::new();
        let service = harness.service();

        let first = service.start_sync(request("merchants")).await.unwrap();
        assert_eq!(first.status, "queued");

        let err = service.start_sync(request("merchants")).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        let forced = service
            .start_sync(StartSyncRequest {
                force_sync: true,
                ..request("merchants")
            })
            .await
            .unwrap();
        assert_ne!(forced.sync_id, first.sync_id);

        // A different scope does not overlap
        service
            .start_sync(StartSyncRequest {
                year: Some(2024),
                month: Some(1),
                ..request("residuals")
            })
            .await
            .unwrap();
        assert_eq!(service.queue_stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_default_period_is_part_of_the_scope() {
        let harness = TestHarness::new();
        let service = harness.service();
        let current = SyncPeriod::containing(harness.clock.now());
        let previous = current.previous();

        let queued = service.start_sync(request("residuals")).await.unwrap();
        let job = service.queue().get(queued.sync_id).await.unwrap().unwrap();
        assert_eq!(job.sync_scope, previous.to_string());
        assert_eq!(job.payload["year"], previous.year);
        assert_eq!(job.payload["month"], previous.month);

        // Same month spelled out: overlaps the implicit request
        let err = service
            .start_sync(StartSyncRequest {
                year: Some(previous.year),
                month: Some(previous.month),
                ..request("residuals")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        let volumes = service.start_sync(request("transactions")).await.unwrap();
        let job = service.queue().get(volumes.sync_id).await.unwrap().unwrap();
        assert_eq!(job.sync_scope, current.to_string());

        let merchants = service.start_sync(request("merchants")).await.unwrap();
        let job = service.queue().get(merchants.sync_id).await.unwrap().unwrap();
        assert_eq!(job.sync_scope, DEFAULT_SCOPE);
    }

    #[tokio::test]
    async fn test_validation() {
        let service = TestHarness::new().service();
        assert!(matches!(
            service.start_sync(request("invoices")).await.unwrap_err(),
            SyncError::Validation(_)
        ));
        assert!(service
            .start_sync(StartSyncRequest {
                month: Some(4),
                ..request("residuals")
            })
            .await
            .is_err());
        assert!(service
            .start_sync(StartSyncRequest {
                year: Some(2024),
                ..request("historical")
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_status_lists_queued_jobs() {
        let service = TestHarness::new().service();
        let queued = service.start_sync(request("daily")).await.unwrap();

        let report = service.get_sync_status(None, 10).await.unwrap();
        assert_eq!(report.syncs.len(), 1);
        assert_eq!(report.syncs[0].status, "queued");
        assert_eq!(report.syncs[0].sync_type, "daily");

        let one = service.get_sync_status(Some(queued.sync_id), 10).await.unwrap();
        assert_eq!(one.syncs[0].sync_id, queued.sync_id);
        assert!(matches!(
            service.get_sync_status(Some(Uuid::new_v4()), 10).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            service.get_progress(queued.sync_id).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
    }
}
