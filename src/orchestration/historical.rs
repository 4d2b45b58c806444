//! # Historical Sync
//!
//! Full backfill: every merchant, then transactions and residuals month by
//! month from the configured epoch through the current month, then the
//! calculated-metrics refresh. A failed month is recorded and the walk moves
//! on to the next one.

use crate::error::{Result, SyncError};
use crate::models::{RecordKind, SyncMode, SyncPeriod};
use crate::orchestration::context::SyncContext;
use crate::orchestration::record_sync::SubSyncSpec;
use crate::orchestration::run::{RunSummary, SyncRun};
use crate::queue::job_types;
use tracing::{info, instrument};
use uuid::Uuid;

const MERCHANTS_DONE_AT: f64 = 10.0;
const MONTHS_DONE_AT: f64 = 90.0;

#[derive(Debug, Clone)]
pub struct HistoricalSyncManager {
    ctx: SyncContext,
}

impl HistoricalSyncManager {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Months the backfill covers, oldest first
    pub fn months(&self) -> Result<Vec<SyncPeriod>> {
        let epoch = self.ctx.orchestrator.historical_epoch().ok_or_else(|| {
            SyncError::Configuration("historical start month is out of range".to_string())
        })?;
        let current = SyncPeriod::containing(self.ctx.clock.now());
        Ok(SyncPeriod::range_inclusive(epoch, current))
    }

    #[instrument(skip(self), fields(sync_type = job_types::HISTORICAL))]
    pub async fn run(&self, sync_id: Uuid) -> RunSummary {
        let mut run = SyncRun::start(&self.ctx, sync_id, job_types::HISTORICAL).await;
        if let Err(e) = self.execute(&mut run).await {
            run.abort(e);
        }
        run.finish().await
    }

    async fn execute(&self, run: &mut SyncRun<'_>) -> Result<()> {
        let months = self.months()?;
        info!(
            sync_id = %run.sync_id(),
            months = months.len(),
            first = ?months.first().map(ToString::to_string),
            "Starting historical backfill"
        );

        run.sub_sync(
            SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full).in_band(0.0, MERCHANTS_DONE_AT),
        )
        .await?;

        let span = (MONTHS_DONE_AT - MERCHANTS_DONE_AT) / months.len().max(1) as f64;
        for (i, month) in months.iter().enumerate() {
            let start = MERCHANTS_DONE_AT + span * i as f64;
            let mid = start + span / 2.0;

            run.sub_sync(
                SubSyncSpec::new(RecordKind::Transaction, SyncMode::Full)
                    .for_period(*month)
                    .in_band(start, mid),
            )
            .await?;
            run.sub_sync(
                SubSyncSpec::new(RecordKind::Residual, SyncMode::Full)
                    .for_period(*month)
                    .in_band(mid, start + span),
            )
            .await?;

            // Spread the load on the CRM between months
            let pause = self.ctx.orchestrator.inter_month_pause();
            if i + 1 < months.len() && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        run.refresh_views(MONTHS_DONE_AT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::test_helpers::{merchant_payloads, monthly_payloads, TestHarness};
    use chrono::TimeZone;
    use chrono::Utc;

    fn harness_in_march_2024() -> TestHarness {
        let harness = TestHarness::new();
        harness
            .clock
            .set(Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap());
        harness
    }

    #[tokio::test]
    async fn test_walks_every_month_from_epoch() {
        let harness = harness_in_march_2024();
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(3), 50);
        harness.crm.load_records(
            RecordKind::Residual,
            monthly_payloads(3, SyncPeriod::new(2024, 1).unwrap()),
            50,
        );
        let manager = HistoricalSyncManager::new(harness.context());

        let months = manager.months().unwrap();
        assert_eq!(
            months.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["2024-01", "2024-02", "2024-03"]
        );

        let summary = manager.run(Uuid::new_v4()).await;
        assert_eq!(summary.status, RunStatus::Completed);
        // merchants + (transactions, residuals) per month
        assert_eq!(summary.reports.len(), 7);
        assert_eq!(harness.crm.request_count(RecordKind::Transaction), 3);
        assert_eq!(harness.datastore.metric_refreshes(), 1);
        assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 3);
    }

    #[tokio::test]
    async fn test_failed_month_does_not_stop_the_walk() {
        let harness = harness_in_march_2024();
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(2), 50);
        harness.crm.fail_next(
            RecordKind::Transaction,
            crate::error::SyncError::http(400, "/transactions", "bad month"),
        );
        let manager = HistoricalSyncManager::new(harness.context());

        let summary = manager.run(Uuid::new_v4()).await;
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.errors.len(), 1);
        assert!(!summary.retryable);
        assert_eq!(harness.crm.request_count(RecordKind::Transaction), 3);

        let run = harness.run_record(summary.sync_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert!(run.completed_at.is_some());
    }
}
