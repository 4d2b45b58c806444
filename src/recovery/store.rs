use crate::error::Result;
use crate::models::{FailedSyncItem, NewFailedSyncItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

/// Persistence for individually failed sync items. Rows are only ever
/// resolved, never deleted.
#[async_trait]
pub trait FailedItemStore: Send + Sync {
    async fn insert(&self, item: &NewFailedSyncItem, now: DateTime<Utc>) -> Result<FailedSyncItem>;

    async fn get(&self, id: Uuid) -> Result<Option<FailedSyncItem>>;

    /// Oldest first; all runs when `sync_id` is `None`
    async fn list_unresolved(&self, sync_id: Option<Uuid>) -> Result<Vec<FailedSyncItem>>;

    /// Stamp `resolved_at`; false when missing or already resolved
    async fn mark_resolved(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Count another failed retry and replace the stored error details
    async fn record_retry_failure(&self, id: Uuid, error_details: &Value) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryFailedItemStore {
    items: Mutex<Vec<FailedSyncItem>>,
}

impl MemoryFailedItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<FailedSyncItem> {
        self.items.lock().clone()
    }
}

#[async_trait]
impl FailedItemStore for MemoryFailedItemStore {
    async fn insert(&self, item: &NewFailedSyncItem, now: DateTime<Utc>) -> Result<FailedSyncItem> {
        let stored = FailedSyncItem {
            id: Uuid::new_v4(),
            sync_id: item.sync_id,
            item_type: item.item_type.clone(),
            item_id: item.item_id.clone(),
            error_details: item.error_details.clone(),
            is_transient: item.is_transient,
            retry_count: 0,
            created_at: now,
            resolved_at: None,
        };
        self.items.lock().push(stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<FailedSyncItem>> {
        Ok(self.items.lock().iter().find(|i| i.id == id).cloned())
    }

    async fn list_unresolved(&self, sync_id: Option<Uuid>) -> Result<Vec<FailedSyncItem>> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|i| !i.is_resolved() && sync_id.map_or(true, |s| i.sync_id == s))
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut items = self.items.lock();
        match items.iter_mut().find(|i| i.id == id && !i.is_resolved()) {
            Some(item) => {
                item.resolved_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_retry_failure(&self, id: Uuid, error_details: &Value) -> Result<()> {
        if let Some(item) = self.items.lock().iter_mut().find(|i| i.id == id) {
            item.retry_count += 1;
            item.error_details = error_details.clone();
        }
        Ok(())
    }
}
