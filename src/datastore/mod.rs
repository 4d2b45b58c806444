//! # Datastore
//!
//! Two seams over the relational store:
//!
//! - [`RecordStore`]: idempotent upserts of CRM records keyed by natural key,
//!   with content-hash change detection, plus the calculated-metrics refresh
//! - [`SyncHistoryStore`]: watermarks, rate-limit telemetry and run records,
//!   the history the strategy analyzer and the status interface read
//!
//! [`PgDatastore`] implements both over Postgres; [`MemoryDatastore`] is the
//! in-process equivalent selected by `datastore.backend = "memory"`.

pub mod memory;
pub mod postgres;

pub use memory::MemoryDatastore;
pub use postgres::PgDatastore;

use crate::error::Result;
use crate::models::{CrmRecord, RateLimitRecord, SyncMode, SyncRunRecord, SyncWatermark, UpsertOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert a batch atomically: either every record is applied or none is.
    /// Outcomes are returned in input order.
    async fn upsert_records(&self, records: &[CrmRecord]) -> Result<Vec<UpsertOutcome>>;

    async fn upsert_record(&self, record: &CrmRecord) -> Result<UpsertOutcome>;

    /// Rebuild derived per-merchant metrics after a sync
    async fn refresh_calculated_metrics(&self) -> Result<()>;
}

#[async_trait]
pub trait SyncHistoryStore: Send + Sync {
    async fn record_watermark(&self, watermark: &SyncWatermark) -> Result<()>;

    /// Newest watermark for the pair, optionally restricted to one mode
    async fn latest_watermark(
        &self,
        data_type: &str,
        sync_scope: &str,
        mode: Option<SyncMode>,
    ) -> Result<Option<SyncWatermark>>;

    /// Newest first, optionally only rows created after `since`
    async fn watermark_history(
        &self,
        data_type: &str,
        sync_scope: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<SyncWatermark>>;

    async fn record_rate_limit(&self, record: &RateLimitRecord) -> Result<()>;

    async fn latest_rate_limit(&self, service: &str) -> Result<Option<RateLimitRecord>>;

    /// Insert or replace the run record for `run.sync_id`
    async fn save_run(&self, run: &SyncRunRecord) -> Result<()>;

    async fn get_run(&self, sync_id: Uuid) -> Result<Option<SyncRunRecord>>;

    /// Newest first
    async fn list_runs(&self, limit: i64) -> Result<Vec<SyncRunRecord>>;
}
