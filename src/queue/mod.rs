//! # Job Queue
//!
//! Durable, priority-ordered work queue for sync jobs.
//!
//! ## Key Features
//!
//! - **Priority Ordering**: `(priority desc, created_at asc)` among due jobs
//! - **Atomic Claiming**: `FOR UPDATE SKIP LOCKED` in Postgres, one mutex in memory
//! - **Backoff Rescheduling**: failed jobs return to `pending` with an exponential delay
//! - **Leases**: a claimed job carries `lease_expires_at`; workers heartbeat it and
//!   the [`LeaseSweeper`] reclaims jobs whose worker went away
//!
//! ```text
//! enqueue ─▶ pending ─dequeue─▶ processing ─┬─▶ completed
//!              ▲                            ├─▶ failed (attempts exhausted)
//!              └──── record_failure ────────┘
//! pending ─cancel─▶ cancelled
//! ```

pub mod job;
pub mod memory;
pub mod postgres;
pub mod processor;
pub mod store;
pub mod sweeper;

pub use job::{job_types, FailureOutcome, JobStatus, NewSyncJob, QueueStats, SyncJob, DEFAULT_SCOPE};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use processor::{JobHandler, JobOutcome, ProcessedJob, QueueProcessor, QueueProcessorConfig};
pub use store::JobStore;
pub use sweeper::LeaseSweeper;

use crate::clock::Clock;
use crate::config::QueueSettings;
use crate::error::{Result, SyncError};
use crate::logging::log_job_operation;
use crate::resilience::BackoffCalculator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    backoff: BackoffCalculator,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("settings", &self.settings)
            .finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            backoff: BackoffCalculator::new(settings.backoff_config()),
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    #[instrument(skip(self, job), fields(job_type = %job.job_type, scope = %job.sync_scope))]
    pub async fn enqueue(&self, job: NewSyncJob) -> Result<Uuid> {
        let job = job.into_job(self.clock.now());
        self.store.insert(&job).await?;
        log_job_operation(
            "enqueue",
            job.id,
            &job.job_type,
            job.status.as_str(),
            None,
            Some(&format!("priority={}", job.priority)),
        );
        Ok(job.id)
    }

    /// Enqueue unless a pending or processing job already exists for the same
    /// `(job_type, sync_scope)`. The check is best-effort: two concurrent
    /// callers can both pass it.
    pub async fn enqueue_exclusive(&self, job: NewSyncJob) -> Result<Uuid> {
        if let Some(active) = self.find_active(&job.job_type, &job.sync_scope).await? {
            return Err(SyncError::Conflict(format!(
                "{} sync for scope '{}' is already {} (job {})",
                active.job_type, active.sync_scope, active.status, active.id
            )));
        }
        self.enqueue(job).await
    }

    /// Claim the next due job, optionally restricted to `job_types`
    #[instrument(skip(self))]
    pub async fn dequeue(&self, job_types: Option<&[String]>, worker_id: &str) -> Result<Option<SyncJob>> {
        let now = self.clock.now();
        let lease_until = now + self.lease_timeout();
        let job = self
            .store
            .claim_next(job_types, worker_id, now, lease_until)
            .await?;

        if let Some(job) = &job {
            log_job_operation(
                "dequeue",
                job.id,
                &job.job_type,
                job.status.as_str(),
                Some(job.attempts),
                Some(worker_id),
            );
        }
        Ok(job)
    }

    /// Settle a job's status. Pass the claiming worker's id as `owner` to make
    /// the update conditional on that worker still holding the job.
    pub async fn mark_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        owner: Option<&str>,
    ) -> Result<bool> {
        let updated = self
            .store
            .set_status(job_id, status, error, owner, self.clock.now())
            .await?;
        if updated {
            debug!(job_id = %job_id, status = %status, "Job status updated");
        } else {
            warn!(
                job_id = %job_id,
                status = %status,
                owner = owner,
                "Job not updated (missing, already processed or held by another worker)"
            );
        }
        Ok(updated)
    }

    /// Count a failed attempt: reschedule with backoff, or fail at `max_attempts`.
    ///
    /// `None` when the job is missing, already terminal, or no longer held by
    /// `owner`.
    #[instrument(skip(self, error))]
    pub async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
        owner: Option<&str>,
    ) -> Result<Option<FailureOutcome>> {
        let now = self.clock.now();
        let backoff = &self.backoff;
        let reschedule = move |attempts: i32| -> DateTime<Utc> {
            let delay = backoff.delay_for_attempt(u32::try_from(attempts).unwrap_or(0));
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
        };

        let Some(outcome) = self
            .store
            .record_failure(job_id, error, max_attempts, owner, now, &reschedule)
            .await?
        else {
            warn!(job_id = %job_id, owner = owner, "Failure not recorded (job not held)");
            return Ok(None);
        };

        match outcome {
            FailureOutcome::Rescheduled {
                attempts,
                next_attempt_at,
            } => info!(
                job_id = %job_id,
                attempts,
                max_attempts,
                next_attempt_at = %next_attempt_at,
                error = error,
                "🟡 Job rescheduled after failure"
            ),
            FailureOutcome::Failed { attempts } => warn!(
                job_id = %job_id,
                attempts,
                error = error,
                "🔴 Job failed permanently"
            ),
        }
        Ok(Some(outcome))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats(self.clock.now()).await
    }

    /// Delete terminal jobs older than `max_age_days`
    pub async fn cleanup(&self, max_age_days: u32) -> Result<u64> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(max_age_days));
        let removed = self.store.delete_processed_before(cutoff).await?;
        if removed > 0 {
            info!(removed, max_age_days, "Cleaned up processed jobs");
        }
        Ok(removed)
    }

    /// Cancel a pending job; false when it is not cancellable
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = self.store.cancel(job_id, self.clock.now()).await?;
        if cancelled {
            info!(job_id = %job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    pub async fn find_active(&self, job_type: &str, sync_scope: &str) -> Result<Option<SyncJob>> {
        self.store.find_active(job_type, sync_scope).await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        self.store.get(job_id).await
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<SyncJob>> {
        self.store.list_recent(limit).await
    }

    /// Heartbeat for a job being processed by `worker_id`
    pub async fn extend_lease(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let lease_until = self.clock.now() + self.lease_timeout();
        self.store.extend_lease(job_id, worker_id, lease_until).await
    }

    /// Return expired `processing` jobs to the queue; returns how many were reclaimed
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let reclaimed = self
            .store
            .reclaim_expired(self.clock.now(), self.settings.max_attempts)
            .await?;
        for job in &reclaimed {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                status = %job.status,
                "🚨 Reclaimed job with expired lease"
            );
        }
        Ok(reclaimed.len())
    }

    fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.lease_timeout())
            .unwrap_or_else(|_| chrono::Duration::minutes(15))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn queue() -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let settings = QueueSettings {
            jitter_enabled: false,
            base_delay_seconds: 10,
            max_delay_seconds: 600,
            ..QueueSettings::default()
        };
        let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), settings, clock.clone());
        (queue, clock)
    }

    #[tokio::test]
    async fn test_priority_then_age_ordering() {
        let (queue, _) = queue();
        let job1 = queue.enqueue(NewSyncJob::new("merchants").with_priority(5)).await.unwrap();
        let job2 = queue.enqueue(NewSyncJob::new("residuals").with_priority(10)).await.unwrap();
        let job3 = queue.enqueue(NewSyncJob::new("volumes").with_priority(5)).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.dequeue(None, "worker-1").await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![job2, job1, job3]);
    }

    #[tokio::test]
    async fn test_job_type_filter_and_schedule() {
        let (queue, clock) = queue();
        let later = clock.now() + chrono::Duration::minutes(5);
        queue
            .enqueue(NewSyncJob::new("daily").scheduled_for(later))
            .await
            .unwrap();
        let merchants = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();

        let only_daily = vec!["daily".to_string()];
        assert!(queue.dequeue(Some(&only_daily), "w").await.unwrap().is_none());

        clock.advance(chrono::Duration::minutes(5));
        let claimed = queue.dequeue(Some(&only_daily), "w").await.unwrap().unwrap();
        assert_eq!(claimed.job_type, "daily");
        assert_eq!(claimed.worker_id.as_deref(), Some("w"));

        let next = queue.dequeue(None, "w").await.unwrap().unwrap();
        assert_eq!(next.id, merchants);
    }

    #[tokio::test]
    async fn test_failure_reschedules_then_fails() {
        let (queue, clock) = queue();
        let id = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();
        queue.dequeue(None, "w").await.unwrap().unwrap();

        let outcome = queue
            .record_failure(id, "503 from CRM", 2, Some("w"))
            .await
            .unwrap()
            .unwrap();
        match outcome {
            FailureOutcome::Rescheduled {
                attempts,
                next_attempt_at,
            } => {
                assert_eq!(attempts, 1);
                // base 10s * 2^1
                assert_eq!(next_attempt_at, clock.now() + chrono::Duration::seconds(20));
            }
            other => panic!("expected reschedule, got {other:?}"),
        }
        assert!(queue.dequeue(None, "w").await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(20));
        queue.dequeue(None, "w").await.unwrap().unwrap();
        let outcome = queue
            .record_failure(id, "503 again", 2, Some("w"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Failed { attempts: 2 });

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.processed_at.is_some());
        assert_eq!(job.last_error.as_deref(), Some("503 again"));

        // Immutable once processed
        assert!(!queue
            .mark_status(id, JobStatus::Completed, None, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_enqueue_conflicts() {
        let (queue, _) = queue();
        let first = queue
            .enqueue_exclusive(NewSyncJob::new("merchants").with_scope("2024-03"))
            .await
            .unwrap();
        let err = queue
            .enqueue_exclusive(NewSyncJob::new("merchants").with_scope("2024-03"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        queue
            .enqueue_exclusive(NewSyncJob::new("merchants").with_scope("2024-04"))
            .await
            .unwrap();

        queue
            .mark_status(first, JobStatus::Completed, None, None)
            .await
            .unwrap();
        queue
            .enqueue_exclusive(NewSyncJob::new("merchants").with_scope("2024-03"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (queue, _) = queue();
        let pending = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();
        assert!(queue.cancel(pending).await.unwrap());
        assert_eq!(
            queue.get(pending).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!queue.cancel(pending).await.unwrap());

        let running = queue.enqueue(NewSyncJob::new("residuals")).await.unwrap();
        queue.dequeue(None, "w").await.unwrap();
        assert!(!queue.cancel(running).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_leases_are_reclaimed() {
        let (queue, clock) = queue();
        let id = queue.enqueue(NewSyncJob::new("historical")).await.unwrap();
        queue.dequeue(None, "w1").await.unwrap().unwrap();

        clock.advance(chrono::Duration::minutes(10));
        assert!(queue.extend_lease(id, "w1").await.unwrap());
        assert!(!queue.extend_lease(id, "w2").await.unwrap());

        clock.advance(chrono::Duration::minutes(14));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_reclaimed_job_ignores_previous_owner() {
        let (queue, clock) = queue();
        let id = queue.enqueue(NewSyncJob::new("residuals")).await.unwrap();
        queue.dequeue(None, "worker-1").await.unwrap().unwrap();

        clock.advance(chrono::Duration::minutes(16));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
        let reclaimed = queue.dequeue(None, "worker-2").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);

        // worker-1 finishes late; its writes must not land on worker-2's claim
        assert!(!queue
            .mark_status(id, JobStatus::Completed, None, Some("worker-1"))
            .await
            .unwrap());
        assert!(queue
            .record_failure(id, "late timeout", 3, Some("worker-1"))
            .await
            .unwrap()
            .is_none());

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("worker-2"));
        assert_eq!(job.attempts, 1);
        assert!(job.processed_at.is_none());

        assert!(queue
            .mark_status(id, JobStatus::Completed, None, Some("worker-2"))
            .await
            .unwrap());
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let (queue, clock) = queue();
        let done = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();
        queue.enqueue(NewSyncJob::new("residuals")).await.unwrap();
        queue
            .mark_status(done, JobStatus::Completed, None, None)
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.due, 1);
        assert_eq!(stats.total(), 2);

        assert_eq!(queue.cleanup(30).await.unwrap(), 0);
        clock.advance(chrono::Duration::days(31));
        assert_eq!(queue.cleanup(30).await.unwrap(), 1);
        assert!(queue.get(done).await.unwrap().is_none());
    }
}
