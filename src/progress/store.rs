use crate::error::Result;
use crate::models::SyncProgress;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Persistence for live progress snapshots, one row per sync run
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn upsert(&self, progress: &SyncProgress) -> Result<()>;

    async fn get(&self, sync_id: Uuid) -> Result<Option<SyncProgress>>;

    async fn delete(&self, sync_id: Uuid) -> Result<bool>;

    /// Snapshots whose phase is not terminal, newest first
    async fn list_active(&self) -> Result<Vec<SyncProgress>>;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    rows: DashMap<Uuid, SyncProgress>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn upsert(&self, progress: &SyncProgress) -> Result<()> {
        self.rows.insert(progress.sync_id, progress.clone());
        Ok(())
    }

    async fn get(&self, sync_id: Uuid) -> Result<Option<SyncProgress>> {
        Ok(self.rows.get(&sync_id).map(|r| r.value().clone()))
    }

    async fn delete(&self, sync_id: Uuid) -> Result<bool> {
        Ok(self.rows.remove(&sync_id).is_some())
    }

    async fn list_active(&self) -> Result<Vec<SyncProgress>> {
        let mut active: Vec<SyncProgress> = self
            .rows
            .iter()
            .filter(|r| !r.phase.is_terminal())
            .map(|r| r.value().clone())
            .collect();
        active.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        Ok(active)
    }
}
