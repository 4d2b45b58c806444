//! # Daily Sync
//!
//! Incremental top-up: merchants changed since the last merchant watermark,
//! today's transactions, last month's residuals once they are expected to be
//! published, then the metrics refresh.

use crate::error::Result;
use crate::models::{DataType, RecordKind, SyncMode, SyncPeriod};
use crate::orchestration::context::SyncContext;
use crate::orchestration::record_sync::{SubSyncSpec, DEFAULT_SCOPE};
use crate::orchestration::run::{RunSummary, SyncRun};
use crate::queue::job_types;
use crate::strategy::NextSyncType;
use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DailySyncManager {
    ctx: SyncContext,
}

impl DailySyncManager {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Start of the merchant window: the last watermark, else the default lookback
    pub async fn merchant_window_start(&self) -> Result<DateTime<Utc>> {
        let last = self
            .ctx
            .history
            .latest_watermark(DataType::Merchants.as_str(), DEFAULT_SCOPE, None)
            .await?;
        Ok(match last {
            Some(watermark) => watermark.last_sync_timestamp,
            None => self.ctx.clock.now() - Duration::days(self.ctx.orchestrator.default_lookback_days),
        })
    }

    #[instrument(skip(self), fields(sync_type = job_types::DAILY))]
    pub async fn run(&self, sync_id: Uuid) -> RunSummary {
        let mut run = SyncRun::start(&self.ctx, sync_id, job_types::DAILY).await;
        if let Err(e) = self.execute(&mut run).await {
            run.abort(e);
        }
        run.finish().await
    }

    async fn execute(&self, run: &mut SyncRun<'_>) -> Result<()> {
        let now = self.ctx.clock.now();
        let since = self.merchant_window_start().await?;

        // Advisory only: the daily run stays incremental
        match self
            .ctx
            .analyzer
            .analyze_sync_strategy(DataType::Merchants.as_str(), DEFAULT_SCOPE)
            .await
        {
            Ok(rec) if rec.next_sync_type != NextSyncType::Incremental => info!(
                sync_id = %run.sync_id(),
                recommended = %rec.next_sync_type,
                reason = %rec.reason,
                "Daily sync runs incrementally despite recommendation"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Sync strategy analysis failed"),
        }

        run.sub_sync(
            SubSyncSpec::new(RecordKind::Merchant, SyncMode::Incremental)
                .since(Some(since))
                .in_band(0.0, 30.0),
        )
        .await?;

        let current = SyncPeriod::containing(now);
        run.sub_sync(
            SubSyncSpec::new(RecordKind::Transaction, SyncMode::Incremental)
                .for_period(current)
                .on_date(now.date_naive())
                .in_band(30.0, 60.0),
        )
        .await?;

        if now.day() >= self.ctx.orchestrator.residuals_available_day {
            run.sub_sync(
                SubSyncSpec::new(RecordKind::Residual, SyncMode::Full)
                    .for_period(current.previous())
                    .in_band(60.0, 90.0),
            )
            .await?;
        } else {
            debug!(
                day = now.day(),
                available_from = self.ctx.orchestrator.residuals_available_day,
                "Last month's residuals not published yet, skipping"
            );
        }

        run.refresh_views(90.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SyncHistoryStore;
    use crate::models::{RunStatus, SyncWatermark};
    use crate::test_helpers::{merchant_payloads, TestHarness};
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_uses_last_watermark_and_skips_early_residuals() {
        let harness = TestHarness::new();
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 6, 0, 0).unwrap();
        harness.clock.set(now);
        let last = now - Duration::hours(26);
        harness
            .datastore
            .record_watermark(&SyncWatermark {
                data_type: "merchants".into(),
                sync_scope: DEFAULT_SCOPE.into(),
                sync_mode: SyncMode::Incremental,
                last_sync_timestamp: last,
                records_processed: 10,
                records_changed: 1,
                error_count: 0,
                inconsistency_count: 0,
                created_at: last,
            })
            .await
            .unwrap();
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(2), 50);
        let manager = DailySyncManager::new(harness.context());

        let summary = manager.run(Uuid::new_v4()).await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.reports.len(), 2);

        let requests = harness.crm.requests();
        assert_eq!(requests[0].modified_since, Some(last));
        let tx = requests.iter().find(|r| r.kind == RecordKind::Transaction).unwrap();
        assert_eq!(tx.date, Some(now.date_naive()));
        assert_eq!(harness.crm.request_count(RecordKind::Residual), 0);
    }

    #[tokio::test]
    async fn test_fetches_previous_month_residuals_mid_month() {
        let harness = TestHarness::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 16, 6, 0, 0).unwrap();
        harness.clock.set(now);
        let manager = DailySyncManager::new(harness.context());

        assert_eq!(
            manager.merchant_window_start().await.unwrap(),
            now - Duration::days(30)
        );

        let summary = manager.run(Uuid::new_v4()).await;
        assert_eq!(summary.reports.len(), 3);
        let residuals = harness
            .crm
            .requests()
            .into_iter()
            .find(|r| r.kind == RecordKind::Residual)
            .unwrap();
        assert_eq!(residuals.period, SyncPeriod::new(2023, 12));
    }
}
