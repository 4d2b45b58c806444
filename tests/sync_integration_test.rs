//! End-to-end sync runs over the memory backend and a scripted CRM

use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{info, Level};
use uuid::Uuid;

use crm_sync::datastore::SyncHistoryStore;
use crm_sync::error::SyncError;
use crm_sync::models::{DataType, RecordKind, RunStatus, SyncMode, SyncPeriod, SyncWatermark};
use crm_sync::orchestration::{StartSyncRequest, TargetedSyncManager, TargetedSyncRequest};
use crm_sync::queue::JobOutcome;
use crm_sync::strategy::NextSyncType;
use crm_sync::test_helpers::{self, merchant_payloads, monthly_payloads, TestHarness};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_test_writer()
        .try_init();
}

fn merchants(force_full: bool) -> TargetedSyncRequest {
    TargetedSyncRequest {
        data_type: DataType::Merchants,
        period: None,
        force_full,
    }
}

#[tokio::test]
async fn test_one_bad_record_makes_run_partial() {
    init_tracing();
    info!("🧪 One record out of ten fails on every write");

    let harness = TestHarness::new();
    harness
        .crm
        .load_records(RecordKind::Merchant, merchant_payloads(10), 100);
    harness
        .datastore
        .inject_failure("M0004", SyncError::Network("connection reset".into()), None);

    let summary = TargetedSyncManager::new(harness.context())
        .run(Uuid::new_v4(), merchants(true))
        .await;

    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.total_processed(), 10);
    assert_eq!(summary.total_unresolved(), 1);
    assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 9);
    assert!(harness.datastore.get_record(RecordKind::Merchant, "M0004").is_none());

    let failed = harness.failed_items.all();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item_id, "M0004");
    assert_eq!(failed[0].sync_id, summary.sync_id);
    assert!(failed[0].is_transient);
    assert!(failed[0].resolved_at.is_none());

    let run = harness.run_record(summary.sync_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert!(run.completed_at.is_some());

    // Partial runs still advance the watermark
    let watermark = harness
        .datastore
        .latest_watermark("merchants", "default", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(watermark.error_count, 1);
}

#[tokio::test]
async fn test_bad_records_in_adjacent_chunks_do_not_trip_datastore_breaker() {
    init_tracing();
    info!("🧪 Two records in neighbouring chunks fail on every write");

    let mut config = test_helpers::fast_config();
    config.orchestrator.upsert_batch_size = 2;
    let harness = TestHarness::with_config(config);
    harness
        .crm
        .load_records(RecordKind::Merchant, merchant_payloads(40), 100);
    for key in ["M0001", "M0002"] {
        harness
            .datastore
            .inject_failure(key, SyncError::Network("connection reset".into()), None);
    }
    let ctx = harness.context();

    let summary = TargetedSyncManager::new(ctx.clone())
        .run(Uuid::new_v4(), merchants(true))
        .await;

    assert_eq!(summary.status, RunStatus::Partial);
    assert_eq!(summary.total_processed(), 40);
    assert_eq!(summary.total_unresolved(), 2);
    assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 38);
    assert!(harness.datastore.get_record(RecordKind::Merchant, "M0039").is_some());
    assert_eq!(ctx.datastore_executor.breaker().consecutive_failures(), 0);
    assert!(!ctx.datastore_executor.breaker().is_open());

    // The metrics refresh still ran behind a closed breaker
    assert_eq!(harness.datastore.metric_refreshes(), 1);
    let mut failed: Vec<_> = harness
        .failed_items
        .all()
        .into_iter()
        .map(|item| item.item_id)
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["M0001", "M0002"]);
}

#[tokio::test]
async fn test_finished_runs_release_live_progress() {
    init_tracing();
    let harness = TestHarness::new();
    harness
        .crm
        .load_records(RecordKind::Merchant, merchant_payloads(3), 2);
    let ctx = harness.context();
    let manager = TargetedSyncManager::new(ctx.clone());

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(manager.run(Uuid::new_v4(), merchants(true)).await.sync_id);
    }

    assert_eq!(ctx.progress.live_runs(), 0);
    for id in ids {
        let progress = ctx.progress.get_progress(id).await.unwrap().unwrap();
        assert_eq!(progress.progress, 100.0);
    }
}

#[tokio::test]
async fn test_rerun_with_same_payloads_changes_nothing() {
    init_tracing();
    let harness = TestHarness::new();
    harness
        .crm
        .load_records(RecordKind::Merchant, merchant_payloads(6), 4);
    let manager = TargetedSyncManager::new(harness.context());

    let first = manager.run(Uuid::new_v4(), merchants(true)).await;
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.reports[0].inserted, 6);
    let stored = harness
        .datastore
        .get_record(RecordKind::Merchant, "M0003")
        .unwrap();

    let second = manager.run(Uuid::new_v4(), merchants(true)).await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.reports[0].unchanged, 6);
    assert_eq!(second.reports[0].changed(), 0);
    assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 6);
    assert_eq!(
        harness
            .datastore
            .get_record(RecordKind::Merchant, "M0003")
            .unwrap()
            .content_hash,
        stored.content_hash
    );

    // A changed payload is an update, not a new row
    let mut changed = merchant_payloads(6);
    changed[3]["status"] = json!("closed");
    harness.crm.load_records(RecordKind::Merchant, changed, 4);
    let third = manager.run(Uuid::new_v4(), merchants(true)).await;
    assert_eq!(third.reports[0].updated, 1);
    assert_eq!(third.reports[0].unchanged, 5);
    assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 6);
}

#[tokio::test]
async fn test_queued_historical_job_walks_every_month() {
    init_tracing();
    let harness = TestHarness::new();
    harness
        .clock
        .set(Utc.with_ymd_and_hms(2024, 3, 20, 6, 0, 0).unwrap());
    harness
        .crm
        .load_records(RecordKind::Merchant, merchant_payloads(3), 100);
    // The scripted CRM serves the same residual page for every month
    harness.crm.load_records(
        RecordKind::Residual,
        monthly_payloads(2, SyncPeriod::new(2024, 1).unwrap()),
        100,
    );
    let system = harness.system();

    let queued = system
        .service()
        .start_sync(StartSyncRequest {
            data_type: "historical".into(),
            year: None,
            month: None,
            force_sync: false,
        })
        .await
        .unwrap();

    let processed = system
        .processor("worker-1")
        .run_once()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processed.job_id, queued.sync_id);
    assert!(matches!(processed.outcome, JobOutcome::Completed(_)));

    let run = harness.run_record(queued.sync_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.sync_type, "historical");
    assert_eq!(harness.datastore.record_count(RecordKind::Merchant), 3);
    assert_eq!(harness.datastore.metric_refreshes(), 1);

    let progress = system.service().get_progress(queued.sync_id).await.unwrap();
    assert_eq!(progress.progress, 100.0);

    let report = system
        .service()
        .get_sync_status(Some(queued.sync_id), 10)
        .await
        .unwrap();
    assert_eq!(report.syncs.len(), 1);
    assert_eq!(report.syncs[0].status, "completed");
    assert_eq!(report.queue.completed, 1);
}

async fn record_watermark(harness: &TestHarness, mode: SyncMode, minutes: i64) {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes);
    harness
        .datastore
        .record_watermark(&SyncWatermark {
            data_type: "merchants".into(),
            sync_scope: "default".into(),
            sync_mode: mode,
            last_sync_timestamp: at,
            records_processed: 100,
            records_changed: 0,
            error_count: 0,
            inconsistency_count: 0,
            created_at: at,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_strategy_escalates_after_too_many_incrementals() {
    init_tracing();
    let harness = TestHarness::new();
    let analyzer = harness.context().analyzer.clone();

    let first = analyzer
        .analyze_sync_strategy("merchants", "default")
        .await
        .unwrap();
    assert!(first.recommend_full_sync);
    assert_eq!(first.next_sync_type, NextSyncType::Full);

    record_watermark(&harness, SyncMode::Full, 0).await;
    for i in 1..=47 {
        record_watermark(&harness, SyncMode::Incremental, i).await;
    }
    let steady = analyzer
        .analyze_sync_strategy("merchants", "default")
        .await
        .unwrap();
    assert_eq!(steady.next_sync_type, NextSyncType::Incremental);
    assert!(!steady.recommend_full_sync);

    for i in 48..=50 {
        record_watermark(&harness, SyncMode::Incremental, i).await;
    }
    let escalated = analyzer
        .analyze_sync_strategy("merchants", "default")
        .await
        .unwrap();
    assert!(escalated.recommend_full_sync);
    assert_eq!(escalated.next_sync_type, NextSyncType::Full);
    assert!(escalated.reason.contains("incremental"));
}
