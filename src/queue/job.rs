use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job types understood by the sync job handler
pub mod job_types {
    pub const MERCHANTS: &str = "merchants";
    pub const RESIDUALS: &str = "residuals";
    pub const VOLUMES: &str = "volumes";
    pub const ALL: &str = "all";
    pub const HISTORICAL: &str = "historical";
    pub const DAILY: &str = "daily";

    pub const KNOWN: &[&str] = &[MERCHANTS, RESIDUALS, VOLUMES, ALL, HISTORICAL, DAILY];
}

/// Scope used when a job is not restricted to a period
pub const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Pending or processing: counts toward the one-active-job-per-scope rule
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of sync work in the durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub job_type: String,
    pub sync_scope: String,
    /// Higher runs first
    pub priority: i32,
    pub status: JobStatus,
    pub payload: Value,
    /// Not eligible for dequeue before this instant
    pub scheduled_for: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the job reaches a terminal status; the job is immutable afterwards
    pub processed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

impl SyncJob {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }
}

/// Request to enqueue a job
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncJob {
    pub job_type: String,
    pub sync_scope: String,
    pub priority: i32,
    pub payload: Value,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewSyncJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            sync_scope: DEFAULT_SCOPE.to_string(),
            priority: 0,
            payload: Value::Object(Default::default()),
            scheduled_for: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.sync_scope = scope.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub(crate) fn into_job(self, now: DateTime<Utc>) -> SyncJob {
        SyncJob {
            id: Uuid::new_v4(),
            job_type: self.job_type,
            sync_scope: self.sync_scope,
            priority: self.priority,
            status: JobStatus::Pending,
            payload: self.payload,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            attempts: 0,
            last_error: None,
            created_at: now,
            processed_at: None,
            lease_expires_at: None,
            worker_id: None,
        }
    }
}

/// Counts by status plus the age of the oldest eligible job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Pending jobs whose `scheduled_for` has passed
    pub due: i64,
    pub oldest_due_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn count(&mut self, job: &SyncJob, now: DateTime<Utc>) {
        match job.status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        if job.is_due(now) {
            self.due += 1;
            self.oldest_due_at = Some(match self.oldest_due_at {
                Some(oldest) => oldest.min(job.scheduled_for),
                None => job.scheduled_for,
            });
        }
    }
}

/// What `record_failure` did with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back to pending, eligible again at `next_attempt_at`
    Rescheduled {
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts exhausted; terminal
    Failed { attempts: i32 },
}

impl FailureOutcome {
    pub fn attempts(&self) -> i32 {
        match self {
            FailureOutcome::Rescheduled { attempts, .. } | FailureOutcome::Failed { attempts } => {
                *attempts
            }
        }
    }
}
