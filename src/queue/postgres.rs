//! Postgres-backed job store on the `sync_jobs` table.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so any number of workers can poll the
//! same table without handing one job to two of them.

use crate::error::{Result, SyncError};
use crate::queue::store::{JobStore, RescheduleFn};
use crate::queue::{FailureOutcome, JobStatus, QueueStats, SyncJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, job_type, sync_scope, priority, status, payload, scheduled_for, \
     attempts, last_error, created_at, processed_at, lease_expires_at, worker_id";

#[derive(Debug, FromRow)]
struct SyncJobRow {
    id: Uuid,
    job_type: String,
    sync_scope: String,
    priority: i32,
    status: String,
    payload: Value,
    scheduled_for: DateTime<Utc>,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: SyncJobRow) -> Result<Self> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(SyncError::Database)?;
        Ok(SyncJob {
            id: row.id,
            job_type: row.job_type,
            sync_scope: row.sync_scope,
            priority: row.priority,
            status,
            payload: row.payload,
            scheduled_for: row.scheduled_for,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
            lease_expires_at: row.lease_expires_at,
            worker_id: row.worker_id,
        })
    }
}

fn convert_rows(rows: Vec<SyncJobRow>) -> Result<Vec<SyncJob>> {
    rows.into_iter().map(SyncJob::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_job(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: Uuid,
        owner: Option<&str>,
    ) -> Result<Option<SyncJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE id = $1 AND processed_at IS NULL \
               AND ($2::TEXT IS NULL OR (status = 'processing' AND worker_id = $2)) \
             FOR UPDATE"
        );
        sqlx::query_as::<_, SyncJobRow>(&query)
            .bind(job_id)
            .bind(owner)
            .fetch_optional(&mut **tx)
            .await?
            .map(SyncJob::try_from)
            .transpose()
    }

    async fn write_failure(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &SyncJob,
        outcome: &FailureOutcome,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match outcome {
            FailureOutcome::Failed { attempts } => {
                sqlx::query(
                    "UPDATE sync_jobs SET status = 'failed', attempts = $2, last_error = $3, \
                     processed_at = $4, lease_expires_at = NULL, worker_id = NULL, updated_at = $4 \
                     WHERE id = $1",
                )
                .bind(job.id)
                .bind(attempts)
                .bind(error)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
            FailureOutcome::Rescheduled {
                attempts,
                next_attempt_at,
            } => {
                sqlx::query(
                    "UPDATE sync_jobs SET status = 'pending', attempts = $2, last_error = $3, \
                     scheduled_for = $4, lease_expires_at = NULL, worker_id = NULL, updated_at = $5 \
                     WHERE id = $1",
                )
                .bind(job.id)
                .bind(attempts)
                .bind(error)
                .bind(next_attempt_at)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

fn failure_outcome(
    attempts_before: i32,
    max_attempts: i32,
    reschedule: RescheduleFn<'_>,
) -> FailureOutcome {
    let attempts = attempts_before + 1;
    if attempts >= max_attempts {
        FailureOutcome::Failed { attempts }
    } else {
        FailureOutcome::Rescheduled {
            attempts,
            next_attempt_at: reschedule(attempts),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    async fn insert(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_jobs (id, job_type, sync_scope, priority, status, payload, \
             scheduled_for, attempts, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.sync_scope)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(job.scheduled_for)
        .bind(job.attempts)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert sync job: {}", e);
            SyncError::from(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_next(
        &self,
        job_types: Option<&[String]>,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<SyncJob>> {
        let query = format!(
            "UPDATE sync_jobs \
             SET status = 'processing', worker_id = $2, lease_expires_at = $3, updated_at = $4 \
             WHERE id = ( \
                 SELECT id FROM sync_jobs \
                 WHERE status = 'pending' AND scheduled_for <= $4 \
                   AND ($1::TEXT[] IS NULL OR job_type = ANY($1)) \
                 ORDER BY priority DESC, created_at ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING {JOB_COLUMNS}"
        );

        let types: Option<Vec<String>> = job_types.map(<[String]>::to_vec);
        let row = sqlx::query_as::<_, SyncJobRow>(&query)
            .bind(types)
            .bind(worker_id)
            .bind(lease_until)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to claim sync job: {}", e);
                SyncError::from(e)
            })?;

        match row {
            Some(row) => {
                let job = SyncJob::try_from(row)?;
                debug!(job_id = %job.id, job_type = %job.job_type, "Claimed sync job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1");
        sqlx::query_as::<_, SyncJobRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(SyncJob::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let processed_at = status.is_terminal().then_some(now);
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = $2, \
                 last_error = COALESCE($3, last_error), \
                 processed_at = $4, \
                 lease_expires_at = CASE WHEN $4 IS NULL THEN lease_expires_at ELSE NULL END, \
                 updated_at = $5 \
             WHERE id = $1 AND processed_at IS NULL \
               AND ($6::TEXT IS NULL OR (status = 'processing' AND worker_id = $6))",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .bind(processed_at)
        .bind(now)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, reschedule))]
    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
        owner: Option<&str>,
        now: DateTime<Utc>,
        reschedule: RescheduleFn<'_>,
    ) -> Result<Option<FailureOutcome>> {
        let mut tx = self.pool.begin().await?;
        let Some(job) = Self::lock_job(&mut tx, job_id, owner).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let outcome = failure_outcome(job.attempts, max_attempts, reschedule);
        Self::write_failure(&mut tx, &job, &outcome, error, now).await?;
        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn cancel(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'cancelled', processed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_active(&self, job_type: &str, sync_scope: &str) -> Result<Option<SyncJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE job_type = $1 AND sync_scope = $2 AND status IN ('pending', 'processing') \
             ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, SyncJobRow>(&query)
            .bind(job_type)
            .bind(sync_scope)
            .fetch_optional(&self.pool)
            .await?
            .map(SyncJob::try_from)
            .transpose()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<SyncJob>> {
        let query =
            format!("SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY created_at DESC LIMIT $1");
        let rows = sqlx::query_as::<_, SyncJobRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_rows(rows)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let (due, oldest_due_at): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(scheduled_for) FROM sync_jobs \
             WHERE status = 'pending' AND scheduled_for <= $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let mut stats = QueueStats {
            due,
            oldest_due_at,
            ..Default::default()
        };
        for (status, count) in counts {
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Processing) => stats.processing = count,
                Ok(JobStatus::Completed) => stats.completed = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Ok(JobStatus::Cancelled) => stats.cancelled = count,
                Err(e) => return Err(SyncError::Database(e)),
            }
        }
        Ok(stats)
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_jobs \
             WHERE status IN ('completed', 'failed', 'cancelled') AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET lease_expires_at = $3 \
             WHERE id = $1 AND status = 'processing' AND worker_id = $2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> Result<Vec<SyncJob>> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE status = 'processing' AND lease_expires_at < $1 \
             FOR UPDATE SKIP LOCKED"
        );
        let expired = convert_rows(
            sqlx::query_as::<_, SyncJobRow>(&query)
                .bind(now)
                .fetch_all(&mut *tx)
                .await?,
        )?;

        let reschedule = move |_: i32| now;
        let mut reclaimed = Vec::with_capacity(expired.len());
        for mut job in expired {
            let outcome = failure_outcome(job.attempts, max_attempts, &reschedule);
            Self::write_failure(&mut tx, &job, &outcome, "lease expired", now).await?;

            job.attempts = outcome.attempts();
            job.worker_id = None;
            job.lease_expires_at = None;
            job.last_error = Some("lease expired".to_string());
            match outcome {
                FailureOutcome::Failed { .. } => {
                    job.status = JobStatus::Failed;
                    job.processed_at = Some(now);
                }
                FailureOutcome::Rescheduled {
                    next_attempt_at, ..
                } => {
                    job.status = JobStatus::Pending;
                    job.scheduled_for = next_attempt_at;
                }
            }
            reclaimed.push(job);
        }
        tx.commit().await?;
        Ok(reclaimed)
    }
}
