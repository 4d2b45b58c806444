//! Worker loop that pulls jobs off the [`JobQueue`] and hands them to a [`JobHandler`].
//!
//! While a handler runs, the processor heartbeats the job's lease so the
//! [`crate::queue::LeaseSweeper`] only reclaims jobs whose worker actually died.

use crate::config::{ProcessorConfig, QueueSettings};
use crate::error::{Result, SyncError};
use crate::queue::{FailureOutcome, JobQueue, JobStatus, SyncJob};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result a handler reports for one job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    /// Finished, but some items were recorded as failed
    Partial(Value),
    Failed { error: String, retryable: bool },
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        JobOutcome::Failed {
            error: error.into(),
            retryable,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "completed",
            JobOutcome::Partial(_) => "partial",
            JobOutcome::Failed { .. } => "failed",
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &SyncJob) -> JobOutcome;
}

/// What happened to a job claimed by [`QueueProcessor::run_once`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedJob {
    pub job_id: Uuid,
    pub job_type: String,
    pub outcome: JobOutcome,
    /// Set when a failure was counted against the job's attempts
    pub failure: Option<FailureOutcome>,
}

#[derive(Debug, Clone)]
pub struct QueueProcessorConfig {
    pub poll_interval: Duration,
    pub max_consecutive_errors: u32,
    pub heartbeat_interval: Duration,
    /// `None` processes every job type
    pub job_types: Option<Vec<String>>,
    pub max_attempts: i32,
}

impl QueueProcessorConfig {
    pub fn from_settings(processor: &ProcessorConfig, queue: &QueueSettings) -> Self {
        Self {
            poll_interval: processor.poll_interval(),
            max_consecutive_errors: processor.max_consecutive_errors,
            heartbeat_interval: processor.heartbeat_interval(),
            job_types: if processor.job_types.is_empty() {
                None
            } else {
                Some(processor.job_types.clone())
            },
            max_attempts: queue.max_attempts,
        }
    }
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        Self::from_settings(&ProcessorConfig::default(), &QueueSettings::default())
    }
}

pub struct QueueProcessor {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    worker_id: String,
    config: QueueProcessorConfig,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        worker_id: impl Into<String>,
        config: QueueProcessorConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            worker_id: worker_id.into(),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process at most one job
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run_once(&self) -> Result<Option<ProcessedJob>> {
        let Some(job) = self
            .queue
            .dequeue(self.config.job_types.as_deref(), &self.worker_id)
            .await?
        else {
            return Ok(None);
        };

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            scope = %job.sync_scope,
            attempt = job.attempts + 1,
            "🚀 Processing job"
        );

        let outcome = self.handle_with_heartbeat(&job).await;
        let failure = self.settle(&job, &outcome).await?;

        Ok(Some(ProcessedJob {
            job_id: job.id,
            job_type: job.job_type,
            outcome,
            failure,
        }))
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Loop errors back off `poll_interval * 2^n`; after `max_consecutive_errors`
    /// in a row the loop gives up and returns the last error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            job_types = ?self.config.job_types,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "🟢 Queue processor started"
        );

        let mut consecutive_errors: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(Some(_)) => {
                    consecutive_errors = 0;
                    continue;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.config.poll_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.worker_id,
                        error = %e,
                        consecutive_errors,
                        "Error in queue processing loop"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        error!(
                            worker_id = %self.worker_id,
                            "🔴 Too many consecutive errors, stopping queue processor"
                        );
                        return Err(SyncError::Fatal(format!(
                            "queue processor {} stopped after {consecutive_errors} consecutive errors: {e}",
                            self.worker_id
                        )));
                    }
                    self.config.poll_interval * 2u32.pow(consecutive_errors.min(6))
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Queue processor stopped");
        Ok(())
    }

    async fn handle_with_heartbeat(&self, job: &SyncJob) -> JobOutcome {
        let handling = self.handler.handle(job);
        tokio::pin!(handling);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; the lease was just set by dequeue
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outcome = &mut handling => return outcome,
                _ = heartbeat.tick() => {
                    match self.queue.extend_lease(job.id, &self.worker_id).await {
                        Ok(true) => debug!(job_id = %job.id, "Lease extended"),
                        Ok(false) => warn!(job_id = %job.id, "Lease no longer held by this worker"),
                        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to extend lease"),
                    }
                }
            }
        }
    }

    async fn settle(&self, job: &SyncJob, outcome: &JobOutcome) -> Result<Option<FailureOutcome>> {
        match outcome {
            JobOutcome::Completed(_) => {
                self.queue
                    .mark_status(job.id, JobStatus::Completed, None, Some(&self.worker_id))
                    .await?;
                Ok(None)
            }
            JobOutcome::Partial(_) => {
                self.queue
                    .mark_status(
                        job.id,
                        JobStatus::Completed,
                        Some("completed with failed items"),
                        Some(&self.worker_id),
                    )
                    .await?;
                Ok(None)
            }
            JobOutcome::Failed {
                error,
                retryable: true,
            } => {
                self.queue
                    .record_failure(
                        job.id,
                        error,
                        self.config.max_attempts,
                        Some(&self.worker_id),
                    )
                    .await
            }
            JobOutcome::Failed {
                error,
                retryable: false,
            } => {
                warn!(job_id = %job.id, error = %error, "Job failed with a non-retryable error");
                self.queue
                    .mark_status(job.id, JobStatus::Failed, Some(error), Some(&self.worker_id))
                    .await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::queue::{MemoryJobStore, NewSyncJob};
    use parking_lot::Mutex;
    use serde_json::json;

    struct ScriptedHandler {
        outcomes: Mutex<Vec<JobOutcome>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(outcomes: Vec<JobOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &SyncJob) -> JobOutcome {
            self.seen.lock().push(job.job_type.clone());
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                JobOutcome::Completed(json!({}))
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn setup(outcomes: Vec<JobOutcome>) -> (Arc<JobQueue>, Arc<ScriptedHandler>, QueueProcessor) {
        let queue = Arc::new(JobQueue::new(
            Arc::new(MemoryJobStore::new()),
            QueueSettings {
                jitter_enabled: false,
                ..QueueSettings::default()
            },
            system_clock(),
        ));
        let handler = Arc::new(ScriptedHandler::new(outcomes));
        let config = QueueProcessorConfig {
            poll_interval: Duration::from_millis(5),
            max_consecutive_errors: 3,
            heartbeat_interval: Duration::from_millis(50),
            job_types: None,
            max_attempts: 3,
        };
        let processor = QueueProcessor::new(queue.clone(), handler.clone(), "test-worker", config);
        (queue, handler, processor)
    }

    #[tokio::test]
    async fn test_run_once_empty_queue() {
        let (_, _, processor) = setup(vec![]);
        assert!(processor.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_and_partial_mark_completed() {
        let (queue, _, processor) = setup(vec![
            JobOutcome::Completed(json!({"records": 3})),
            JobOutcome::Partial(json!({"failed": 1})),
        ]);
        let a = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();
        let b = queue.enqueue(NewSyncJob::new("residuals")).await.unwrap();

        processor.run_once().await.unwrap().unwrap();
        let processed = processor.run_once().await.unwrap().unwrap();
        assert_eq!(processed.outcome.label(), "partial");

        for id in [a, b] {
            let job = queue.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.processed_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_reschedules() {
        let (queue, _, processor) = setup(vec![JobOutcome::failed("CRM timed out", true)]);
        let id = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();

        let processed = processor.run_once().await.unwrap().unwrap();
        assert!(matches!(
            processed.failure,
            Some(FailureOutcome::Rescheduled { attempts: 1, .. })
        ));

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.scheduled_for > job.created_at);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_immediately() {
        let (queue, _, processor) = setup(vec![JobOutcome::failed("unknown job type", false)]);
        let id = queue.enqueue(NewSyncJob::new("mystery")).await.unwrap();

        let processed = processor.run_once().await.unwrap().unwrap();
        assert!(processed.failure.is_none());

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error.as_deref(), Some("unknown job type"));
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let (queue, handler, processor) = setup(vec![]);
        queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();
        queue.enqueue(NewSyncJob::new("daily").with_priority(9)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let processor = Arc::new(processor);
        let worker = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(rx).await })
        };

        for _ in 0..200 {
            if queue.stats().await.unwrap().completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        worker.await.unwrap().unwrap();

        assert_eq!(*handler.seen.lock(), vec!["daily", "merchants"]);
    }
}
