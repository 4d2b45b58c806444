//! Queue-facing entry point: turns a claimed [`SyncJob`] into a sync run.

use crate::error::{Result, SyncError};
use crate::models::{DataType, RunStatus, SyncPeriod};
use crate::orchestration::context::SyncContext;
use crate::orchestration::daily::DailySyncManager;
use crate::orchestration::historical::HistoricalSyncManager;
use crate::orchestration::run::RunSummary;
use crate::orchestration::targeted::{TargetedSyncManager, TargetedSyncRequest};
use crate::queue::{job_types, JobHandler, JobOutcome, SyncJob};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tracing::warn;

/// Parameters carried in a job's payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncJobPayload {
    pub year: Option<i32>,
    pub month: Option<u32>,
    #[serde(alias = "force_sync")]
    pub force: bool,
}

impl SyncJobPayload {
    pub fn period(&self) -> Result<Option<SyncPeriod>> {
        match (self.year, self.month) {
            (None, None) => Ok(None),
            (Some(year), month) => SyncPeriod::new(year, month.unwrap_or(1))
                .map(Some)
                .ok_or_else(|| SyncError::validation(format!("invalid month {month:?}"))),
            (None, Some(_)) => Err(SyncError::validation("month given without year")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncJobHandler {
    historical: HistoricalSyncManager,
    daily: DailySyncManager,
    targeted: TargetedSyncManager,
}

impl SyncJobHandler {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            historical: HistoricalSyncManager::new(ctx.clone()),
            daily: DailySyncManager::new(ctx.clone()),
            targeted: TargetedSyncManager::new(ctx),
        }
    }

    /// Run the sync a job describes; the job id doubles as the sync id
    pub async fn run_job(&self, job: &SyncJob) -> Result<RunSummary> {
        let payload: SyncJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| SyncError::validation(format!("invalid job payload: {e}")))?;

        match job.job_type.as_str() {
            job_types::HISTORICAL => Ok(self.historical.run(job.id).await),
            job_types::DAILY => Ok(self.daily.run(job.id).await),
            other => {
                let data_type = DataType::from_str(other)?;
                let request = TargetedSyncRequest {
                    data_type,
                    period: payload.period()?,
                    force_full: payload.force,
                };
                Ok(self.targeted.run(job.id, request).await)
            }
        }
    }
}

pub fn outcome_for(summary: &RunSummary) -> JobOutcome {
    let stats = json!({
        "sync_id": summary.sync_id,
        "status": summary.status,
        "stats": summary.stats(),
        "errors": summary.errors,
    });
    match summary.status {
        RunStatus::Completed | RunStatus::Running => JobOutcome::Completed(stats),
        RunStatus::Partial => JobOutcome::Partial(stats),
        RunStatus::Failed => JobOutcome::failed(
            if summary.errors.is_empty() {
                "sync failed".to_string()
            } else {
                summary.errors.join("; ")
            },
            summary.retryable,
        ),
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn handle(&self, job: &SyncJob) -> JobOutcome {
        match self.run_job(job).await {
            Ok(summary) => outcome_for(&summary),
            Err(e) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "Job rejected");
                JobOutcome::failed(e.to_string(), false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use crate::queue::NewSyncJob;
    use crate::test_helpers::{merchant_payloads, TestHarness};

    #[test]
    fn test_payload_period() {
        let payload: SyncJobPayload =
            serde_json::from_value(json!({"year": 2024, "month": 3, "force_sync": true})).unwrap();
        assert!(payload.force);
        assert_eq!(payload.period().unwrap(), SyncPeriod::new(2024, 3));

        let bad = SyncJobPayload {
            month: Some(13),
            year: Some(2024),
            ..Default::default()
        };
        assert!(bad.period().is_err());
        assert!(SyncJobPayload { month: Some(2), ..Default::default() }.period().is_err());
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_not_retried() {
        let harness = TestHarness::new();
        let handler = SyncJobHandler::new(harness.context());
        let job = NewSyncJob::new("invoices").into_job(chrono::Utc::now());

        match handler.handle(&job).await {
            JobOutcome::Failed { retryable, error } => {
                assert!(!retryable);
                assert!(error.contains("invoices"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merchant_job_uses_job_id_as_sync_id() {
        let harness = TestHarness::new();
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(2), 10);
        let handler = SyncJobHandler::new(harness.context());
        let job = NewSyncJob::new(job_types::MERCHANTS).into_job(chrono::Utc::now());

        let outcome = handler.handle(&job).await;
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        assert!(harness.run_record(job.id).await.is_some());
    }
}
