//! Persistence seam for the job queue.
//!
//! Stores never read the clock themselves: every time-dependent operation is
//! handed `now` by [`crate::queue::JobQueue`], which keeps scheduling logic in
//! one place and lets tests drive time explicitly.

use crate::error::Result;
use crate::queue::{FailureOutcome, JobStatus, QueueStats, SyncJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Computes the next eligible instant for a job that has failed `attempts` times
pub type RescheduleFn<'a> = &'a (dyn Fn(i32) -> DateTime<Utc> + Send + Sync);

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &SyncJob) -> Result<()>;

    /// Atomically claim the highest-priority, oldest due pending job.
    ///
    /// Ordering is `(priority desc, created_at asc)` among pending jobs with
    /// `scheduled_for <= now`, optionally restricted to `job_types`.
    async fn claim_next(
        &self,
        job_types: Option<&[String]>,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<SyncJob>>;

    async fn get(&self, job_id: Uuid) -> Result<Option<SyncJob>>;

    /// Set a job's status. Terminal statuses stamp `processed_at` and drop the
    /// lease. Jobs that already have `processed_at` are left untouched and
    /// `false` is returned.
    ///
    /// With `owner` set the update only applies while the job is `processing`
    /// under that worker id, so a worker whose lease was reclaimed cannot
    /// settle a job another worker now holds.
    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Increment attempts, then fail the job at `max_attempts` or reschedule it
    /// at `reschedule(attempts)`. `None` when the job does not exist, is
    /// already terminal, or is not held by `owner`.
    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
        owner: Option<&str>,
        now: DateTime<Utc>,
        reschedule: RescheduleFn<'_>,
    ) -> Result<Option<FailureOutcome>>;

    /// Pending-only cancellation
    async fn cancel(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn find_active(&self, job_type: &str, sync_scope: &str) -> Result<Option<SyncJob>>;

    /// Newest first
    async fn list_recent(&self, limit: i64) -> Result<Vec<SyncJob>>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats>;

    /// Delete terminal jobs processed before `cutoff`; returns the number removed
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Heartbeat: push out the lease of a job still held by `worker_id`
    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Return `processing` jobs whose lease expired before `now` to `pending`
    /// (counting the lost run as an attempt) or fail them at `max_attempts`.
    async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> Result<Vec<SyncJob>>;
}
