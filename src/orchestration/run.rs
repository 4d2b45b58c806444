//! Shared lifecycle of one sync run: the run record, phase bookkeeping,
//! sub-sync sequencing, the metrics refresh and the final notification.

use crate::error::{Result, SyncError};
use crate::logging::log_sync_operation;
use crate::models::{ProgressUpdate, RunStatus, SyncPhase, SyncRunRecord};
use crate::notifications::SyncNotification;
use crate::orchestration::context::SyncContext;
use crate::orchestration::record_sync::{run_sub_sync, SubSyncReport, SubSyncSpec};
use crate::orchestration::state::RunStateMachine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub sync_id: Uuid,
    pub sync_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub reports: Vec<SubSyncReport>,
    pub errors: Vec<String>,
    /// Every failure seen was transient; re-queueing the job may help
    pub retryable: bool,
}

impl RunSummary {
    pub fn stats(&self) -> Value {
        run_stats(&self.reports)
    }

    pub fn total_processed(&self) -> i64 {
        self.reports.iter().map(|r| r.processed).sum()
    }

    pub fn total_unresolved(&self) -> i64 {
        self.reports.iter().map(|r| r.unresolved).sum()
    }
}

fn run_stats(reports: &[SubSyncReport]) -> Value {
    json!({
        "sub_syncs": reports.len(),
        "processed": reports.iter().map(|r| r.processed).sum::<i64>(),
        "inserted": reports.iter().map(|r| r.inserted).sum::<i64>(),
        "updated": reports.iter().map(|r| r.updated).sum::<i64>(),
        "unchanged": reports.iter().map(|r| r.unchanged).sum::<i64>(),
        "failed_items": reports.iter().map(|r| r.failed_items).sum::<i64>(),
        "recovered": reports.iter().map(|r| r.recovered).sum::<i64>(),
        "unresolved": reports.iter().map(|r| r.unresolved).sum::<i64>(),
        "collections": reports,
    })
}

pub(crate) struct SyncRun<'a> {
    ctx: &'a SyncContext,
    sync_id: Uuid,
    sync_type: String,
    started_at: DateTime<Utc>,
    state: RunStateMachine,
    status: RunStatus,
    reports: Vec<SubSyncReport>,
    errors: Vec<String>,
    retryable: bool,
    aborted: bool,
}

impl<'a> SyncRun<'a> {
    pub(crate) async fn start(ctx: &'a SyncContext, sync_id: Uuid, sync_type: &str) -> Self {
        let started_at = ctx.clock.now();
        let run = Self {
            ctx,
            sync_id,
            sync_type: sync_type.to_string(),
            started_at,
            state: RunStateMachine::new(sync_id, started_at),
            status: RunStatus::Running,
            reports: Vec::new(),
            errors: Vec::new(),
            retryable: true,
            aborted: false,
        };

        log_sync_operation("start", Some(sync_id), sync_type, "running", None);
        run.save_started().await;
        ctx.progress
            .update_progress(
                sync_id,
                ProgressUpdate::new(SyncPhase::Initializing, 0.0, format!("Starting {sync_type} sync")),
            )
            .await;
        run
    }

    pub(crate) fn sync_id(&self) -> Uuid {
        self.sync_id
    }

    fn enter(&mut self, phase: SyncPhase) -> Result<()> {
        if self.state.current() == phase {
            return Ok(());
        }
        self.state.transition(phase, self.ctx.clock.now()).map(|_| ())
    }

    /// Run one sub-sync and fold its status into the run
    pub(crate) async fn sub_sync(&mut self, spec: SubSyncSpec) -> Result<&SubSyncReport> {
        self.enter(spec.phase())?;
        let report = run_sub_sync(self.ctx, self.sync_id, &spec).await;
        self.absorb(report);
        self.reports
            .last()
            .ok_or_else(|| SyncError::fatal("sub-sync report missing"))
    }

    fn absorb(&mut self, report: SubSyncReport) {
        self.status = self.status.combine(report.status);
        if let Some(e) = &report.error {
            self.errors.push(format!("{}: {e}", report.label));
            self.retryable &= report.retryable;
        }
        self.reports.push(report);
    }

    /// Rebuild derived metrics, retrying transient failures with backoff. A
    /// failure downgrades the run, it does not abort it.
    pub(crate) async fn refresh_views(&mut self, progress_at: f64) -> Result<()> {
        self.enter(SyncPhase::RefreshingViews)?;
        self.ctx
            .progress
            .update_progress(
                self.sync_id,
                ProgressUpdate::new(SyncPhase::RefreshingViews, progress_at, "Refreshing calculated metrics"),
            )
            .await;

        // Each attempt goes through the datastore breaker; an open circuit is
        // not retried
        let breaker = self.ctx.datastore_executor.breaker().clone();
        let records = self.ctx.records.clone();
        let result = self
            .ctx
            .recovery
            .retry_with_backoff("refresh calculated metrics", || {
                let breaker = breaker.clone();
                let records = records.clone();
                async move {
                    breaker
                        .call(|| records.refresh_calculated_metrics())
                        .await
                        .map_err(SyncError::from)
                }
            })
            .await;

        if let Err(e) = result {
            warn!(sync_id = %self.sync_id, error = %e, "Calculated metrics refresh failed");
            self.status = self.status.combine(RunStatus::Failed);
            self.retryable &= e.root_cause().is_retryable();
            self.errors.push(format!("refresh calculated metrics: {e}"));
        }
        Ok(())
    }

    /// Give up on the rest of the run
    pub(crate) fn abort(&mut self, err: SyncError) {
        error!(sync_id = %self.sync_id, sync_type = %self.sync_type, error = %err, "Sync run aborted");
        self.retryable &= err.root_cause().is_retryable();
        self.errors.push(err.to_string());
        self.aborted = true;
    }

    pub(crate) async fn finish(mut self) -> RunSummary {
        let status = if self.aborted {
            RunStatus::Failed
        } else {
            match self.status {
                // Nothing ran and nothing failed
                RunStatus::Running => RunStatus::Completed,
                other => other,
            }
        };

        let completed_at = self.ctx.clock.now();
        if status == RunStatus::Failed {
            self.state.fail(completed_at);
        } else if let Err(e) = self.state.transition(SyncPhase::Completed, completed_at) {
            warn!(sync_id = %self.sync_id, error = %e, "Could not mark run phase completed");
        }

        let final_phase = self.state.current();
        self.ctx
            .progress
            .update_progress(
                self.sync_id,
                ProgressUpdate::new(final_phase, 100.0, format!("Sync {status}"))
                    .with_details(json!({ "errors": self.errors })),
            )
            .await;
        self.ctx.progress.release(self.sync_id);

        let summary = RunSummary {
            sync_id: self.sync_id,
            sync_type: self.sync_type.clone(),
            status,
            started_at: self.started_at,
            completed_at,
            reports: std::mem::take(&mut self.reports),
            errors: std::mem::take(&mut self.errors),
            retryable: status == RunStatus::Failed && self.retryable,
        };

        self.save_summary(&summary).await;

        let notification = SyncNotification {
            sync_id: summary.sync_id,
            sync_type: summary.sync_type.clone(),
            outcome: status.into(),
            stats: summary.stats(),
            error: (!summary.errors.is_empty()).then(|| summary.errors.join("; ")),
            started_at: summary.started_at,
            completed_at,
        };
        self.ctx.notifications.notify(&notification).await;

        log_sync_operation(
            "finish",
            Some(summary.sync_id),
            &summary.sync_type,
            status.as_str(),
            summary.errors.first().map(String::as_str),
        );
        summary
    }

    async fn save_started(&self) {
        let record = SyncRunRecord {
            sync_id: self.sync_id,
            sync_type: self.sync_type.clone(),
            status: RunStatus::Running,
            started_at: self.started_at,
            completed_at: None,
            stats: run_stats(&self.reports),
            errors: self.errors.clone(),
        };
        if let Err(e) = self.ctx.history.save_run(&record).await {
            warn!(sync_id = %self.sync_id, error = %e, "Failed to save sync run record");
        }
    }

    async fn save_summary(&self, summary: &RunSummary) {
        let record = SyncRunRecord {
            sync_id: summary.sync_id,
            sync_type: summary.sync_type.clone(),
            status: summary.status,
            started_at: summary.started_at,
            completed_at: Some(summary.completed_at),
            stats: summary.stats(),
            errors: summary.errors.clone(),
        };
        if let Err(e) = self.ctx.history.save_run(&record).await {
            warn!(sync_id = %self.sync_id, error = %e, "Failed to save sync run record");
        }
    }
}
