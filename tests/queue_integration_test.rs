//! Job queue behavior through the public surface: ordering, retries, leases

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use crm_sync::clock::Clock;
use crm_sync::orchestration::StartSyncRequest;
use crm_sync::queue::{
    FailureOutcome, JobHandler, JobOutcome, JobStatus, NewSyncJob, QueueProcessor,
    QueueProcessorConfig, SyncJob,
};
use crm_sync::test_helpers::TestHarness;
use crm_sync::SyncError;

struct AlwaysTransientFailure;

#[async_trait]
impl JobHandler for AlwaysTransientFailure {
    async fn handle(&self, _job: &SyncJob) -> JobOutcome {
        JobOutcome::failed("crm timed out", true)
    }
}

#[tokio::test]
async fn test_higher_priority_dequeued_first_then_fifo() {
    let harness = TestHarness::new();
    let queue = harness.system().queue().clone();

    let mut ids = Vec::new();
    for (job_type, priority) in [("merchants", 5), ("residuals", 10), ("volumes", 5)] {
        ids.push(
            queue
                .enqueue(NewSyncJob::new(job_type).with_priority(priority))
                .await
                .unwrap(),
        );
        harness.clock.advance(Duration::seconds(1));
    }

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue(None, "worker-1").await.unwrap() {
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
        order.push(job.id);
    }
    assert_eq!(order, vec![ids[1], ids[0], ids[2]]);
}

#[tokio::test]
async fn test_job_type_filter_and_future_schedule() {
    let harness = TestHarness::new();
    let queue = harness.system().queue().clone();
    let later = harness.clock.now() + Duration::minutes(5);

    queue
        .enqueue(NewSyncJob::new("daily").scheduled_for(later))
        .await
        .unwrap();
    let merchants = queue.enqueue(NewSyncJob::new("merchants")).await.unwrap();

    let residual_only = vec!["residuals".to_string()];
    assert!(queue
        .dequeue(Some(&residual_only), "worker-1")
        .await
        .unwrap()
        .is_none());

    let claimed = queue.dequeue(None, "worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, merchants);
    // The daily job is not due yet
    assert!(queue.dequeue(None, "worker-1").await.unwrap().is_none());

    harness.clock.advance(Duration::minutes(6));
    let daily = queue.dequeue(None, "worker-1").await.unwrap().unwrap();
    assert_eq!(daily.job_type, "daily");
}

#[tokio::test]
async fn test_transient_failures_back_off_until_attempts_exhausted() {
    let harness = TestHarness::new();
    let queue = harness.system().queue().clone();
    let max_attempts = queue.settings().max_attempts;
    let processor = QueueProcessor::new(
        queue.clone(),
        Arc::new(AlwaysTransientFailure),
        "worker-1",
        QueueProcessorConfig::default(),
    );

    let job_id = queue
        .enqueue(NewSyncJob::new("merchants").with_payload(json!({"force": true})))
        .await
        .unwrap();

    for attempt in 1..max_attempts {
        let processed = processor.run_once().await.unwrap().unwrap();
        match processed.failure {
            Some(FailureOutcome::Rescheduled {
                attempts,
                next_attempt_at,
            }) => {
                assert_eq!(attempts, attempt);
                assert!(next_attempt_at > harness.clock.now());
            }
            other => panic!("expected a reschedule, got {other:?}"),
        }
        // Not eligible again until the backoff elapses
        assert!(processor.run_once().await.unwrap().is_none());
        harness.clock.advance(Duration::hours(2));
    }

    let last = processor.run_once().await.unwrap().unwrap();
    assert_eq!(
        last.failure,
        Some(FailureOutcome::Failed {
            attempts: max_attempts
        })
    );
    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("crm timed out"));
    assert!(job.processed_at.is_some());
}

#[tokio::test]
async fn test_sweeper_reclaims_expired_lease() {
    let harness = TestHarness::new();
    let system = harness.system();
    let queue = system.queue().clone();

    let job_id = queue.enqueue(NewSyncJob::new("residuals")).await.unwrap();
    let claimed = queue.dequeue(None, "crashed-worker").await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);

    let sweeper = system.sweeper();
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

    harness
        .clock
        .advance(Duration::seconds(queue.settings().lease_timeout_seconds as i64 + 1));
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.worker_id.is_none());

    let reclaimed = queue.dequeue(None, "worker-2").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job_id);
}

#[tokio::test]
async fn test_overlapping_trigger_guard() {
    let harness = TestHarness::new();
    let service = harness.service();
    let request = |force_sync| StartSyncRequest {
        data_type: "transactions".into(),
        year: Some(2024),
        month: Some(6),
        force_sync,
    };

    let first = assert_ok!(service.start_sync(request(false)).await);
    let err = assert_err!(service.start_sync(request(false)).await);
    assert!(matches!(err, SyncError::Conflict(_)));

    // Another month is a different scope
    service
        .start_sync(StartSyncRequest {
            month: Some(7),
            ..request(false)
        })
        .await
        .unwrap();

    let forced = service.start_sync(request(true)).await.unwrap();
    assert_ne!(forced.sync_id, first.sync_id);

    let job = service.queue().get(first.sync_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "volumes");
    assert_eq!(job.sync_scope, "2024-06");
    assert_eq!(service.queue_stats().await.unwrap().pending, 3);

    // Once the first job is claimed the guard still holds
    harness.system().queue().dequeue(None, "worker-1").await.unwrap();
    assert_err!(service.start_sync(request(false)).await);
}
