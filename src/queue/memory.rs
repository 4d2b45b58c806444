//! In-process job store. Every operation runs under one mutex, which gives the
//! same claim-exactly-once guarantee as `FOR UPDATE SKIP LOCKED`.

use crate::error::Result;
use crate::queue::store::{JobStore, RescheduleFn};
use crate::queue::{FailureOutcome, JobStatus, QueueStats, SyncJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    /// Insertion order breaks ties between equal `(priority, created_at)`
    jobs: Mutex<Vec<SyncJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

fn settleable(job: &SyncJob, job_id: Uuid, owner: Option<&str>) -> bool {
    job.id == job_id
        && job.processed_at.is_none()
        && owner.map_or(true, |owner| {
            job.status == JobStatus::Processing && job.worker_id.as_deref() == Some(owner)
        })
}

fn finish(job: &mut SyncJob, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    if status.is_terminal() {
        job.processed_at = Some(now);
        job.lease_expires_at = None;
    }
}

fn apply_failure(
    job: &mut SyncJob,
    error: &str,
    max_attempts: i32,
    now: DateTime<Utc>,
    reschedule: RescheduleFn<'_>,
) -> FailureOutcome {
    job.attempts += 1;
    job.last_error = Some(error.to_string());
    job.worker_id = None;
    job.lease_expires_at = None;

    if job.attempts >= max_attempts {
        finish(job, JobStatus::Failed, now);
        FailureOutcome::Failed {
            attempts: job.attempts,
        }
    } else {
        let next_attempt_at = reschedule(job.attempts);
        job.status = JobStatus::Pending;
        job.scheduled_for = next_attempt_at;
        FailureOutcome::Rescheduled {
            attempts: job.attempts,
            next_attempt_at,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &SyncJob) -> Result<()> {
        self.jobs.lock().push(job.clone());
        Ok(())
    }

    async fn claim_next(
        &self,
        job_types: Option<&[String]>,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<SyncJob>> {
        let mut jobs = self.jobs.lock();

        let mut best: Option<usize> = None;
        for (idx, job) in jobs.iter().enumerate() {
            if !job.is_due(now) {
                continue;
            }
            if let Some(types) = job_types {
                if !types.iter().any(|t| t == &job.job_type) {
                    continue;
                }
            }
            best = match best {
                Some(current) => {
                    let incumbent = &jobs[current];
                    let better = job.priority > incumbent.priority
                        || (job.priority == incumbent.priority
                            && job.created_at < incumbent.created_at);
                    Some(if better { idx } else { current })
                }
                None => Some(idx),
            };
        }

        Ok(best.map(|idx| {
            let job = &mut jobs[idx];
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.to_string());
            job.lease_expires_at = Some(lease_until);
            job.clone()
        }))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<SyncJob>> {
        Ok(self.jobs.lock().iter().find(|j| j.id == job_id).cloned())
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.iter_mut().find(|j| settleable(j, job_id, owner)) else {
            return Ok(false);
        };

        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        finish(job, status, now);
        Ok(true)
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
        owner: Option<&str>,
        now: DateTime<Utc>,
        reschedule: RescheduleFn<'_>,
    ) -> Result<Option<FailureOutcome>> {
        let mut jobs = self.jobs.lock();
        Ok(jobs
            .iter_mut()
            .find(|j| settleable(j, job_id, owner))
            .map(|job| apply_failure(job, error, max_attempts, now, reschedule)))
    }

    async fn cancel(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Pending)
        {
            Some(job) => {
                finish(job, JobStatus::Cancelled, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_active(&self, job_type: &str, sync_scope: &str) -> Result<Option<SyncJob>> {
        Ok(self
            .jobs
            .lock()
            .iter()
            .find(|j| j.job_type == job_type && j.sync_scope == sync_scope && j.status.is_active())
            .cloned())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<SyncJob>> {
        let jobs = self.jobs.lock();
        let mut recent: Vec<SyncJob> = jobs.iter().rev().cloned().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(recent)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for job in self.jobs.lock().iter() {
            stats.count(job, now);
        }
        Ok(stats)
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|j| !matches!(j.processed_at, Some(at) if at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.status == JobStatus::Processing
                && j.worker_id.as_deref() == Some(worker_id)
        }) {
            Some(job) => {
                job.lease_expires_at = Some(lease_until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> Result<Vec<SyncJob>> {
        let mut jobs = self.jobs.lock();
        let reschedule = move |_: i32| now;
        Ok(jobs
            .iter_mut()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.lease_expires_at.is_some_and(|lease| lease < now)
            })
            .map(|job| {
                apply_failure(job, "lease expired", max_attempts, now, &reschedule);
                job.clone()
            })
            .collect())
    }
}
