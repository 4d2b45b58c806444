use crate::datastore::{RecordStore, SyncHistoryStore};
use crate::error::{Result, SyncError};
use crate::models::{
    CrmRecord, RateLimitRecord, RecordKind, SyncMode, SyncRunRecord, SyncWatermark, UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct InjectedFailure {
    error: SyncError,
    /// `None` fails forever
    remaining: Option<usize>,
}

impl InjectedFailure {
    fn consume(&mut self) -> Option<SyncError> {
        match self.remaining.as_mut() {
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.error.clone())
            }
            None => Some(self.error.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<(RecordKind, String), CrmRecord>,
    watermarks: Vec<SyncWatermark>,
    rate_limits: HashMap<String, RateLimitRecord>,
    runs: Vec<SyncRunRecord>,
    failures: HashMap<String, InjectedFailure>,
    refresh_failure: Option<InjectedFailure>,
}

impl State {
    /// Consume an injected failure for `natural_key`, if any
    fn take_failure(&mut self, natural_key: &str) -> Option<SyncError> {
        let failure = self.failures.get_mut(natural_key)?;
        match failure.consume() {
            Some(error) => Some(error),
            None => {
                self.failures.remove(natural_key);
                None
            }
        }
    }

    fn apply(&mut self, record: &CrmRecord) -> UpsertOutcome {
        let key = (record.kind, record.natural_key.clone());
        match self.records.get(&key) {
            Some(existing) if existing.content_hash == record.content_hash => UpsertOutcome::Unchanged,
            Some(_) => {
                self.records.insert(key, record.clone());
                UpsertOutcome::Updated
            }
            None => {
                self.records.insert(key, record.clone());
                UpsertOutcome::Inserted
            }
        }
    }
}

/// In-process datastore. Failures can be injected per natural key to
/// exercise partial-failure handling.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    state: Mutex<State>,
    metric_refreshes: AtomicU64,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts touching `natural_key` fail with `error`, `times` times or forever
    pub fn inject_failure(&self, natural_key: impl Into<String>, error: SyncError, times: Option<usize>) {
        self.state.lock().failures.insert(
            natural_key.into(),
            InjectedFailure {
                error,
                remaining: times,
            },
        );
    }

    /// Metric refreshes fail with `error`, `times` times or forever
    pub fn fail_metric_refresh(&self, error: SyncError, times: Option<usize>) {
        self.state.lock().refresh_failure = Some(InjectedFailure {
            error,
            remaining: times,
        });
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.refresh_failure = None;
    }

    pub fn record_count(&self, kind: RecordKind) -> usize {
        self.state
            .lock()
            .records
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn get_record(&self, kind: RecordKind, natural_key: &str) -> Option<CrmRecord> {
        self.state
            .lock()
            .records
            .get(&(kind, natural_key.to_string()))
            .cloned()
    }

    pub fn metric_refreshes(&self) -> u64 {
        self.metric_refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordStore for MemoryDatastore {
    async fn upsert_records(&self, records: &[CrmRecord]) -> Result<Vec<UpsertOutcome>> {
        let mut state = self.state.lock();
        for record in records {
            if let Some(error) = state.take_failure(&record.natural_key) {
                return Err(error);
            }
        }
        Ok(records.iter().map(|r| state.apply(r)).collect())
    }

    async fn upsert_record(&self, record: &CrmRecord) -> Result<UpsertOutcome> {
        let mut state = self.state.lock();
        if let Some(error) = state.take_failure(&record.natural_key) {
            return Err(error);
        }
        Ok(state.apply(record))
    }

    async fn refresh_calculated_metrics(&self) -> Result<()> {
        let injected = self
            .state
            .lock()
            .refresh_failure
            .as_mut()
            .and_then(InjectedFailure::consume);
        if let Some(error) = injected {
            return Err(error);
        }
        self.metric_refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl SyncHistoryStore for MemoryDatastore {
    async fn record_watermark(&self, watermark: &SyncWatermark) -> Result<()> {
        self.state.lock().watermarks.push(watermark.clone());
        Ok(())
    }

    async fn latest_watermark(
        &self,
        data_type: &str,
        sync_scope: &str,
        mode: Option<SyncMode>,
    ) -> Result<Option<SyncWatermark>> {
        Ok(self
            .state
            .lock()
            .watermarks
            .iter()
            .rev()
            .filter(|w| w.data_type == data_type && w.sync_scope == sync_scope)
            .find(|w| mode.map_or(true, |m| w.sync_mode == m))
            .cloned())
    }

    async fn watermark_history(
        &self,
        data_type: &str,
        sync_scope: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<SyncWatermark>> {
        Ok(self
            .state
            .lock()
            .watermarks
            .iter()
            .rev()
            .filter(|w| w.data_type == data_type && w.sync_scope == sync_scope)
            .filter(|w| since.map_or(true, |s| w.created_at > s))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn record_rate_limit(&self, record: &RateLimitRecord) -> Result<()> {
        self.state
            .lock()
            .rate_limits
            .insert(record.service.clone(), record.clone());
        Ok(())
    }

    async fn latest_rate_limit(&self, service: &str) -> Result<Option<RateLimitRecord>> {
        Ok(self.state.lock().rate_limits.get(service).cloned())
    }

    async fn save_run(&self, run: &SyncRunRecord) -> Result<()> {
        let mut state = self.state.lock();
        match state.runs.iter_mut().find(|r| r.sync_id == run.sync_id) {
            Some(existing) => *existing = run.clone(),
            None => state.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn get_run(&self, sync_id: Uuid) -> Result<Option<SyncRunRecord>> {
        Ok(self
            .state
            .lock()
            .runs
            .iter()
            .find(|r| r.sync_id == sync_id)
            .cloned())
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<SyncRunRecord>> {
        let mut runs = self.state.lock().runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }
}
