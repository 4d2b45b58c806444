//! Data-type sync triggered through the status interface: one collection (or
//! all of them), optionally pinned to a month.

use crate::error::Result;
use crate::models::{DataType, RecordKind, SyncMode, SyncPeriod};
use crate::orchestration::context::SyncContext;
use crate::orchestration::record_sync::{SubSyncSpec, DEFAULT_SCOPE};
use crate::orchestration::run::{RunSummary, SyncRun};
use crate::strategy::NextSyncType;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetedSyncRequest {
    pub data_type: DataType,
    pub period: Option<SyncPeriod>,
    /// Skip the strategy check and fetch merchants in full
    pub force_full: bool,
}

#[derive(Debug, Clone)]
pub struct TargetedSyncManager {
    ctx: SyncContext,
}

impl TargetedSyncManager {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(data_type = %request.data_type))]
    pub async fn run(&self, sync_id: Uuid, request: TargetedSyncRequest) -> RunSummary {
        let mut run = SyncRun::start(&self.ctx, sync_id, request.data_type.as_str()).await;
        if let Err(e) = self.execute(&mut run, request).await {
            run.abort(e);
        }
        run.finish().await
    }

    async fn merchant_spec(&self, force_full: bool) -> Result<SubSyncSpec> {
        if force_full {
            return Ok(SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full));
        }

        let data_type = DataType::Merchants.as_str();
        let recommendation = self.ctx.analyzer.analyze_sync_strategy(data_type, DEFAULT_SCOPE).await?;
        match recommendation.next_sync_type {
            NextSyncType::Full => Ok(SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full)),
            next => {
                if next == NextSyncType::Deferred {
                    warn!(
                        reason = %recommendation.reason,
                        "Quota is low but the sync was requested explicitly, running incrementally"
                    );
                }
                let since = match self
                    .ctx
                    .history
                    .latest_watermark(data_type, DEFAULT_SCOPE, None)
                    .await?
                {
                    Some(w) => w.last_sync_timestamp,
                    None => {
                        self.ctx.clock.now()
                            - Duration::days(self.ctx.orchestrator.default_lookback_days)
                    }
                };
                Ok(SubSyncSpec::new(RecordKind::Merchant, SyncMode::Incremental).since(Some(since)))
            }
        }
    }

    async fn execute(&self, run: &mut SyncRun<'_>, request: TargetedSyncRequest) -> Result<()> {
        let kinds = request.data_type.record_kinds();
        let current = SyncPeriod::containing(self.ctx.clock.now());
        let step = 90.0 / kinds.len() as f64;

        for (i, kind) in kinds.iter().enumerate() {
            let spec = match kind {
                RecordKind::Merchant => self.merchant_spec(request.force_full).await?,
                RecordKind::Transaction => SubSyncSpec::new(*kind, SyncMode::Full)
                    .for_period(request.period.unwrap_or(current)),
                // Residuals for the running month are not published yet
                RecordKind::Residual => SubSyncSpec::new(*kind, SyncMode::Full)
                    .for_period(request.period.unwrap_or_else(|| current.previous())),
            };
            info!(
                sync_id = %run.sync_id(),
                collection = %spec.label(),
                mode = spec.mode.as_str(),
                "Targeted sub-sync"
            );
            run.sub_sync(spec.in_band(step * i as f64, step * (i + 1) as f64)).await?;
        }

        run.refresh_views(90.0).await
    }
}
