//! # Error Recovery
//!
//! Bookkeeping for records that failed individually while the rest of their
//! batch went through. Each failure becomes a [`FailedSyncItem`] row; transient
//! ones get one immediate inline retry and are resolved if it succeeds.
//! Whatever is left waits for an explicit recovery pass
//! ([`ErrorRecovery::retry_unresolved`]) or an operator. Nothing here enqueues
//! jobs on its own.

pub mod postgres;
pub mod store;

pub use postgres::PgFailedItemStore;
pub use store::{FailedItemStore, MemoryFailedItemStore};

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::models::{FailedSyncItem, NewFailedSyncItem, SyncPeriod};
use crate::resilience::{
    retry_with_backoff, BackoffCalculator, ErrorClassifier, StandardErrorClassifier,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A record that could not be persisted
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item_type: String,
    pub item_id: String,
    pub error: SyncError,
    /// Raw CRM payload, kept so a later pass can rebuild the record
    pub payload: Value,
    pub period: Option<SyncPeriod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Newly persisted failed items
    pub recorded: usize,
    /// Items a retry was attempted for
    pub retried: usize,
    pub recovered: usize,
    /// Ids of items still unresolved after this call
    pub unresolved: Vec<Uuid>,
}

impl RecoveryResult {
    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }
}

/// Payload stored with a failed item
pub fn stored_payload(item: &FailedSyncItem) -> Option<&Value> {
    item.error_details.get("payload").filter(|p| !p.is_null())
}

/// Period stored with a failed item, for monthly record kinds
pub fn stored_period(item: &FailedSyncItem) -> Option<SyncPeriod> {
    item.error_details
        .get("period")
        .cloned()
        .and_then(|p| serde_json::from_value(p).ok())
}

pub struct ErrorRecovery {
    store: Arc<dyn FailedItemStore>,
    classifier: Arc<dyn ErrorClassifier>,
    backoff: BackoffCalculator,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ErrorRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecovery")
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ErrorRecovery {
    pub fn new(
        store: Arc<dyn FailedItemStore>,
        backoff: BackoffCalculator,
        max_retries: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            classifier: Arc::new(StandardErrorClassifier::new()),
            backoff,
            max_retries,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn FailedItemStore> {
        &self.store
    }

    fn error_details(&self, error: &SyncError, payload: &Value, period: Option<SyncPeriod>) -> Value {
        let classification = self.classifier.classify(error.root_cause());
        json!({
            "error": error.to_string(),
            "code": error.root_cause().code(),
            "category": classification.category.to_string(),
            "payload": payload,
            "period": period,
        })
    }

    fn is_transient(&self, error: &SyncError) -> bool {
        self.classifier.classify(error.root_cause()).is_retryable
    }

    /// Persist every failure, retry transient ones inline with backoff, resolve
    /// those that succeed
    pub async fn handle_partial_failure<F, Fut>(
        &self,
        sync_id: Uuid,
        failures: Vec<ItemFailure>,
        retry_op: F,
    ) -> Result<RecoveryResult>
    where
        F: Fn(&FailedSyncItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut result = RecoveryResult::default();
        if failures.is_empty() {
            return Ok(result);
        }

        for failure in failures {
            let is_transient = self.is_transient(&failure.error);
            let new_item = NewFailedSyncItem {
                sync_id,
                item_type: failure.item_type.clone(),
                item_id: failure.item_id.clone(),
                error_details: self.error_details(&failure.error, &failure.payload, failure.period),
                is_transient,
            };
            let item = self.store.insert(&new_item, self.clock.now()).await?;
            result.recorded += 1;

            if !is_transient {
                debug!(
                    sync_id = %sync_id,
                    item_type = %item.item_type,
                    item_id = %item.item_id,
                    error = %failure.error,
                    "Permanent item failure recorded"
                );
                result.unresolved.push(item.id);
                continue;
            }

            result.retried += 1;
            if self.retry_item(&item, &retry_op).await? {
                result.recovered += 1;
            } else {
                result.unresolved.push(item.id);
            }
        }

        info!(
            sync_id = %sync_id,
            recorded = result.recorded,
            recovered = result.recovered,
            unresolved = result.unresolved_count(),
            "Partial failure handled"
        );
        Ok(result)
    }

    /// Recovery pass: retry every unresolved item (optionally for one run)
    pub async fn retry_unresolved<F, Fut>(
        &self,
        sync_id: Option<Uuid>,
        retry_op: F,
    ) -> Result<RecoveryResult>
    where
        F: Fn(&FailedSyncItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut result = RecoveryResult::default();
        for item in self.store.list_unresolved(sync_id).await? {
            result.retried += 1;
            if self.retry_item(&item, &retry_op).await? {
                result.recovered += 1;
            } else {
                result.unresolved.push(item.id);
            }
        }

        info!(
            sync_id = ?sync_id,
            retried = result.retried,
            recovered = result.recovered,
            unresolved = result.unresolved_count(),
            "Recovery pass finished"
        );
        Ok(result)
    }

    pub async fn list_unresolved(&self, sync_id: Option<Uuid>) -> Result<Vec<FailedSyncItem>> {
        self.store.list_unresolved(sync_id).await
    }

    /// Resolve an item by hand
    pub async fn resolve(&self, item_id: Uuid) -> Result<bool> {
        let resolved = self.store.mark_resolved(item_id, self.clock.now()).await?;
        if resolved {
            info!(item_id = %item_id, "Failed sync item resolved");
        }
        Ok(resolved)
    }

    /// [`retry_with_backoff`] with this recovery's backoff settings
    pub async fn retry_with_backoff<T, F, Fut>(&self, context: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.backoff, self.max_retries, context, operation).await
    }

    async fn retry_item<F, Fut>(&self, item: &FailedSyncItem, retry_op: &F) -> Result<bool>
    where
        F: Fn(&FailedSyncItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let context = format!("retry {} {}", item.item_type, item.item_id);
        match self.retry_with_backoff(&context, || retry_op(item)).await {
            Ok(()) => {
                self.store.mark_resolved(item.id, self.clock.now()).await?;
                debug!(item_id = %item.item_id, item_type = %item.item_type, "Item recovered on retry");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    item_id = %item.item_id,
                    item_type = %item.item_type,
                    error = %e,
                    "Item retry failed"
                );
                let period = stored_period(item);
                let payload = stored_payload(item).cloned().unwrap_or(Value::Null);
                let details = self.error_details(&e, &payload, period);
                self.store.record_retry_failure(item.id, &details).await?;
                Ok(false)
            }
        }
    }
}
