//! # Record Sub-Sync
//!
//! One pass over one CRM collection: page through the endpoint, upsert each
//! page in chunks, hand per-record failures to [`crate::recovery`], then write
//! a watermark. The historical, daily and targeted runs are sequences of these.

use crate::crm::PageRequest;
use crate::error::SyncError;
use crate::models::{
    CrmRecord, FailedSyncItem, ProgressUpdate, RecordKind, RunStatus, SyncMode, SyncPeriod,
    SyncPhase, SyncWatermark, UpsertOutcome,
};
use crate::orchestration::context::SyncContext;
use crate::recovery::{stored_payload, stored_period, ItemFailure};
use crate::resilience::BreakerVerdict;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use crate::queue::DEFAULT_SCOPE;

/// What a sub-sync fetches and where it reports progress
#[derive(Debug, Clone, PartialEq)]
pub struct SubSyncSpec {
    pub kind: RecordKind,
    pub mode: SyncMode,
    pub period: Option<SyncPeriod>,
    pub modified_since: Option<DateTime<Utc>>,
    pub date: Option<NaiveDate>,
    /// Overall run progress at the start and end of this sub-sync
    pub progress_band: (f64, f64),
}

impl SubSyncSpec {
    pub fn new(kind: RecordKind, mode: SyncMode) -> Self {
        Self {
            kind,
            mode,
            period: None,
            modified_since: None,
            date: None,
            progress_band: (0.0, 100.0),
        }
    }

    pub fn for_period(mut self, period: SyncPeriod) -> Self {
        self.period = Some(period);
        self
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.modified_since = since;
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn in_band(mut self, start: f64, end: f64) -> Self {
        self.progress_band = (start, end.max(start));
        self
    }

    pub fn phase(&self) -> SyncPhase {
        match self.kind {
            RecordKind::Merchant => SyncPhase::SyncingMerchants,
            RecordKind::Transaction => SyncPhase::SyncingTransactions,
            RecordKind::Residual => SyncPhase::SyncingResiduals,
        }
    }

    pub fn scope(&self) -> String {
        self.period
            .map(|p| p.to_string())
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
    }

    pub fn label(&self) -> String {
        match self.period {
            Some(p) => format!("{} {p}", self.kind.endpoint()),
            None => self.kind.endpoint().to_string(),
        }
    }

    fn first_request(&self, per_page: u32) -> PageRequest {
        let mut request = PageRequest::first(self.kind, per_page).modified_since(self.modified_since);
        if let Some(period) = self.period {
            request = request.for_period(period);
        }
        if let Some(date) = self.date {
            request = request.on_date(date);
        }
        request
    }
}

/// Counters and outcome of one sub-sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSyncReport {
    pub label: String,
    pub kind: RecordKind,
    pub scope: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub pages: u32,
    /// Records received from the CRM
    pub processed: i64,
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
    /// Records that failed validation before reaching the store
    pub invalid: i64,
    pub failed_items: i64,
    pub recovered: i64,
    pub unresolved: i64,
    pub error: Option<String>,
    /// The failure is transient and a later attempt may succeed
    pub retryable: bool,
}

impl SubSyncReport {
    fn new(spec: &SubSyncSpec) -> Self {
        Self {
            label: spec.label(),
            kind: spec.kind,
            scope: spec.scope(),
            mode: spec.mode,
            status: RunStatus::Running,
            pages: 0,
            processed: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            invalid: 0,
            failed_items: 0,
            recovered: 0,
            unresolved: 0,
            error: None,
            retryable: false,
        }
    }

    pub fn changed(&self) -> i64 {
        self.inserted + self.updated
    }

    fn tally(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn fail_with(&mut self, err: &SyncError) {
        self.status = RunStatus::Failed;
        self.error = Some(err.to_string());
        self.retryable =
            err.root_cause().is_retryable() || matches!(err, SyncError::CircuitOpen { .. });
    }
}

/// Record kind for a stored failed item's `item_type`
pub fn kind_for_item_type(item_type: &str) -> Option<RecordKind> {
    [RecordKind::Merchant, RecordKind::Transaction, RecordKind::Residual]
        .into_iter()
        .find(|kind| kind.item_type() == item_type)
}

/// Rebuild the record a failed item stands for from its stored payload
pub fn rebuild_record(item: &FailedSyncItem) -> crate::error::Result<CrmRecord> {
    let kind = kind_for_item_type(&item.item_type).ok_or_else(|| {
        SyncError::validation(format!("unknown item type '{}'", item.item_type))
    })?;
    let payload = stored_payload(item)
        .cloned()
        .ok_or_else(|| SyncError::validation(format!("item {} has no stored payload", item.id)))?;
    CrmRecord::from_payload(kind, payload, stored_period(item))
}

/// Identifier for a payload that could not be turned into a record
fn fallback_item_id(spec: &SubSyncSpec, page: u32, index: usize) -> String {
    format!("{}:page{page}:{index}", spec.label())
}

/// Run one sub-sync. Never returns an error: failures are reported in the
/// [`SubSyncReport`] so the run can carry on with the next collection.
#[instrument(skip(ctx, spec), fields(collection = %spec.label(), mode = %spec.mode.as_str()))]
pub async fn run_sub_sync(ctx: &SyncContext, sync_id: Uuid, spec: &SubSyncSpec) -> SubSyncReport {
    let started_at = ctx.clock.now();
    let mut report = SubSyncReport::new(spec);
    let mut failures: Vec<ItemFailure> = Vec::new();
    let (band_start, band_end) = spec.progress_band;
    let phase = spec.phase();

    let mut truncated = false;
    let mut request = spec.first_request(ctx.per_page);
    loop {
        if request.page > ctx.max_pages {
            warn!(
                sync_id = %sync_id,
                collection = %report.label,
                max_pages = ctx.max_pages,
                "Page limit reached, stopping pagination"
            );
            truncated = true;
            break;
        }

        let operation = format!("fetch {} page {}", spec.kind.endpoint(), request.page);
        let page = match ctx
            .crm_executor
            .execute_with_resilience(&operation, || ctx.crm.fetch_page(&request))
            .await
            .into_result()
        {
            Ok(page) => page,
            Err(e) => {
                error!(sync_id = %sync_id, collection = %report.label, error = %e, "CRM fetch failed");
                report.fail_with(&e);
                break;
            }
        };
        report.pages += 1;

        if let Some(rate_limit) = &page.rate_limit {
            if let Err(e) = ctx.history.record_rate_limit(rate_limit).await {
                warn!(error = %e, "Failed to persist rate limit telemetry");
            }
        }

        let received = page.records.len();
        if let Err(e) =
            persist_page(ctx, spec, request.page, page.records, &mut report, &mut failures).await
        {
            report.fail_with(&e);
            break;
        }

        // Asymptotic within the band: the page count is unknown up front
        let pages = f64::from(report.pages);
        let pct = band_start + (band_end - band_start) * pages / (pages + 1.0);
        ctx.progress
            .update_progress(
                sync_id,
                ProgressUpdate::new(
                    phase,
                    pct,
                    format!("{}: page {} ({received} records)", report.label, report.pages),
                )
                .with_details(json!({
                    "collection": report.label,
                    "processed": report.processed,
                    "changed": report.changed(),
                })),
            )
            .await;

        if !page.has_more {
            break;
        }
        request = request.next_page();
    }

    if !failures.is_empty() {
        report.failed_items = failures.len() as i64;
        let records = ctx.records.clone();
        let fallback_period = spec.period;
        let kind = spec.kind;
        let recovery = ctx
            .recovery
            .handle_partial_failure(sync_id, failures, |item| {
                let records = records.clone();
                let rebuilt = rebuild_record(item).or_else(|_| {
                    stored_payload(item)
                        .cloned()
                        .ok_or_else(|| SyncError::validation("no stored payload"))
                        .and_then(|payload| CrmRecord::from_payload(kind, payload, fallback_period))
                });
                async move {
                    let record = rebuilt?;
                    records.upsert_record(&record).await.map(|_| ())
                }
            })
            .await;
        match recovery {
            Ok(result) => {
                report.recovered = result.recovered as i64;
                report.unresolved = result.unresolved_count() as i64;
            }
            Err(e) => {
                error!(sync_id = %sync_id, error = %e, "Failed to record item failures");
                report.unresolved = report.failed_items;
            }
        }
    }

    if report.status != RunStatus::Failed {
        report.status = settle_status(ctx, &report);
        if report.status == RunStatus::Failed {
            report.error = Some(format!(
                "{} of {} records unresolved",
                report.unresolved, report.processed
            ));
        } else if truncated {
            // Unfetched pages must be picked up by the next run
            report.status = RunStatus::Partial;
            report.error = Some(format!(
                "page limit of {} reached before the last page",
                ctx.max_pages
            ));
        }
    }

    if report.status != RunStatus::Failed && !truncated {
        let watermark = SyncWatermark {
            data_type: spec.kind.data_type().as_str().to_string(),
            sync_scope: report.scope.clone(),
            sync_mode: spec.mode,
            last_sync_timestamp: started_at,
            records_processed: report.processed,
            records_changed: report.changed(),
            error_count: report.unresolved,
            inconsistency_count: report.invalid,
            created_at: ctx.clock.now(),
        };
        if let Err(e) = ctx.history.record_watermark(&watermark).await {
            warn!(sync_id = %sync_id, error = %e, "Failed to record sync watermark");
        }
    }

    info!(
        sync_id = %sync_id,
        collection = %report.label,
        status = %report.status,
        pages = report.pages,
        processed = report.processed,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        unresolved = report.unresolved,
        "Sub-sync finished"
    );
    report
}

fn settle_status(ctx: &SyncContext, report: &SubSyncReport) -> RunStatus {
    if report.unresolved == 0 {
        return RunStatus::Completed;
    }
    let ratio = report.unresolved as f64 / report.processed.max(1) as f64;
    if ratio > ctx.orchestrator.max_item_failure_ratio {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

/// Parse and upsert one page. Only an open datastore circuit aborts the
/// sub-sync; every other failure is narrowed to the records it hit.
async fn persist_page(
    ctx: &SyncContext,
    spec: &SubSyncSpec,
    page: u32,
    payloads: Vec<Value>,
    report: &mut SubSyncReport,
    failures: &mut Vec<ItemFailure>,
) -> crate::error::Result<()> {
    let mut parsed = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.into_iter().enumerate() {
        report.processed += 1;
        match CrmRecord::from_payload(spec.kind, payload.clone(), spec.period) {
            Ok(record) => parsed.push(record),
            Err(e) => {
                report.invalid += 1;
                failures.push(ItemFailure {
                    item_type: spec.kind.item_type().to_string(),
                    item_id: fallback_item_id(spec, page, index),
                    error: e,
                    payload,
                    period: spec.period,
                });
            }
        }
    }

    let batch_size = ctx.orchestrator.upsert_batch_size.max(1);
    for (index, chunk) in parsed.chunks(batch_size).enumerate() {
        let operation = format!("upsert {} {} records", chunk.len(), spec.kind.endpoint());
        let envelope = ctx
            .datastore_executor
            .execute_with_verdict(&operation, || write_chunk(ctx, chunk))
            .await;

        if envelope.circuit_open {
            let err = envelope
                .into_result()
                .err()
                .unwrap_or_else(|| SyncError::fatal("datastore circuit open"));
            // This chunk and the rest of the page were never attempted
            for record in &parsed[index * batch_size..] {
                failures.push(record_failure(record, err.clone()));
            }
            return Err(err);
        }

        match envelope.into_result() {
            Ok(write) => {
                for outcome in write.outcomes {
                    report.tally(outcome);
                }
                for (position, err) in write.failed {
                    failures.push(record_failure(&chunk[position], err));
                }
            }
            Err(err) => {
                for record in chunk {
                    failures.push(record_failure(record, err.clone()));
                }
            }
        }
    }
    Ok(())
}

/// Result of writing one chunk: outcomes of the stored records and the
/// chunk positions that failed
#[derive(Debug, Default)]
struct ChunkWrite {
    outcomes: Vec<UpsertOutcome>,
    failed: Vec<(usize, SyncError)>,
}

/// Batch upsert, falling back to per-record writes when the batch fails.
///
/// Any stored record proves the datastore is up. Only a chunk in which every
/// record failed with a transient error counts against the breaker; a record
/// the store rejects on its own says nothing about the store's health.
async fn write_chunk(
    ctx: &SyncContext,
    chunk: &[CrmRecord],
) -> (crate::error::Result<ChunkWrite>, BreakerVerdict) {
    let batch_error = match ctx.records.upsert_records(chunk).await {
        Ok(outcomes) => {
            return (
                Ok(ChunkWrite {
                    outcomes,
                    failed: Vec::new(),
                }),
                BreakerVerdict::Healthy,
            )
        }
        Err(e) => e,
    };
    debug!(
        chunk = chunk.len(),
        error = %batch_error,
        "Batch upsert failed, falling back to per-record writes"
    );

    let mut write = ChunkWrite::default();
    for (position, record) in chunk.iter().enumerate() {
        match ctx.records.upsert_record(record).await {
            Ok(outcome) => write.outcomes.push(outcome),
            Err(e) => write.failed.push((position, e)),
        }
    }

    let verdict = if write.failed.len() < chunk.len() {
        BreakerVerdict::Healthy
    } else if write
        .failed
        .iter()
        .all(|(_, e)| e.root_cause().is_retryable())
    {
        BreakerVerdict::Unhealthy
    } else {
        BreakerVerdict::Neutral
    };
    (Ok(write), verdict)
}

fn record_failure(record: &CrmRecord, error: SyncError) -> ItemFailure {
    ItemFailure {
        item_type: record.kind.item_type().to_string(),
        item_id: record.natural_key.clone(),
        error,
        payload: record.payload.clone(),
        period: record.period,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SyncHistoryStore;
    use crate::models::DataType;
    use crate::test_helpers::{merchant_payloads, TestHarness};

    #[tokio::test]
    async fn test_pages_through_and_writes_watermark() {
        let harness = TestHarness::new();
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(5), 2);
        let ctx = harness.context();

        let spec = SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full);
        let report = run_sub_sync(&ctx, Uuid::new_v4(), &spec).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.pages, 3);
        assert_eq!(report.processed, 5);
        assert_eq!(report.inserted, 5);
        assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 5);

        let watermark = harness
            .datastore
            .latest_watermark(DataType::Merchants.as_str(), DEFAULT_SCOPE, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watermark.records_processed, 5);
        assert_eq!(watermark.records_changed, 5);

        // Same payloads again: nothing changes
        let again = run_sub_sync(&ctx, Uuid::new_v4(), &spec).await;
        assert_eq!(again.unchanged, 5);
        assert_eq!(again.changed(), 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_becomes_failed_item() {
        let harness = TestHarness::new();
        let mut records = merchant_payloads(3);
        records.push(json!({"name": "no identifier"}));
        harness.crm.load_records(RecordKind::Merchant, records, 10);
        let ctx = harness.context();

        let report = run_sub_sync(
            &ctx,
            Uuid::new_v4(),
            &SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full),
        )
        .await;

        assert_eq!(report.invalid, 1);
        assert_eq!(report.unresolved, 1);
        // 1 of 4 exceeds the default 10% ceiling
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(harness.failed_items.all().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_fails_sub_sync() {
        let harness = TestHarness::new();
        harness.crm.fail_next(RecordKind::Residual, SyncError::http(401, "/residuals", "bad key"));
        let ctx = harness.context();

        let spec = SubSyncSpec::new(RecordKind::Residual, SyncMode::Full)
            .for_period(SyncPeriod::new(2024, 5).unwrap());
        let report = run_sub_sync(&ctx, Uuid::new_v4(), &spec).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(!report.retryable);
        assert!(harness
            .datastore
            .latest_watermark("residuals", "2024-05", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_record_failures_leave_datastore_breaker_closed() {
        let mut config = crate::test_helpers::fast_config();
        config.orchestrator.upsert_batch_size = 2;
        let harness = TestHarness::with_config(config);
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(12), 4);
        // One bad record per chunk, in every chunk of the first two pages
        for key in ["M0001", "M0002", "M0004", "M0007"] {
            harness
                .datastore
                .inject_failure(key, SyncError::Network("connection reset".into()), None);
        }
        let ctx = harness.context();

        let report = run_sub_sync(
            &ctx,
            Uuid::new_v4(),
            &SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full),
        )
        .await;

        assert_eq!(report.pages, 3);
        assert_eq!(report.processed, 12);
        assert_eq!(report.failed_items, 4);
        assert_eq!(report.unresolved, 4);
        assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 8);
        assert!(report.error.as_deref().is_some_and(|e| e.contains("unresolved")));
        assert_eq!(ctx.datastore_executor.breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_records_every_unattempted_record() {
        let mut config = crate::test_helpers::fast_config();
        config.orchestrator.upsert_batch_size = 2;
        let harness = TestHarness::with_config(config);
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(5), 10);
        let ctx = harness.context();
        ctx.datastore_executor.breaker().force_open();

        let report = run_sub_sync(
            &ctx,
            Uuid::new_v4(),
            &SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full),
        )
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.retryable);
        assert_eq!(report.failed_items, 5);
        assert_eq!(harness.failed_items.all().len(), 5);
        assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 0);
    }

    #[tokio::test]
    async fn test_page_limit_settles_partial_without_watermark() {
        let harness = TestHarness::new();
        harness.crm.load_records(RecordKind::Merchant, merchant_payloads(4), 2);
        let mut ctx = harness.context();
        ctx.max_pages = 1;

        let report = run_sub_sync(
            &ctx,
            Uuid::new_v4(),
            &SubSyncSpec::new(RecordKind::Merchant, SyncMode::Full),
        )
        .await;

        assert_eq!(report.pages, 1);
        assert_eq!(report.processed, 2);
        assert_eq!(report.status, RunStatus::Partial);
        assert!(report
            .error
            .as_deref()
            .is_some_and(|e| e.contains("page limit of 1")));
        assert!(harness
            .datastore
            .latest_watermark(DataType::Merchants.as_str(), DEFAULT_SCOPE, None)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rebuild_record_from_failed_item() {
        let item = FailedSyncItem {
            id: Uuid::new_v4(),
            sync_id: Uuid::new_v4(),
            item_type: "residual".into(),
            item_id: "M1:2024-02".into(),
            error_details: json!({
                "payload": {"merchant_number": "M1", "amount": 12.5},
                "period": {"year": 2024, "month": 2},
            }),
            is_transient: true,
            retry_count: 0,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let record = rebuild_record(&item).unwrap();
        assert_eq!(record.kind, RecordKind::Residual);
        assert_eq!(record.natural_key, "M1:2024-02");
    }
}
