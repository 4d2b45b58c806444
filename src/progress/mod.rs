//! # Progress Tracking
//!
//! [`ProgressTracker`] keeps one live snapshot per sync run. Every update is
//! persisted (so a restarted dashboard can poll it) and then broadcast to
//! subscribers such as the SSE endpoint. Persistence is best-effort: a store
//! error is logged and the broadcast still goes out.
//!
//! Within a phase progress only moves forward; a lower percentage for the same
//! phase is clamped up to the last reported value.
//!
//! The in-memory snapshot lives only while a run is active. A finished run
//! releases it and later reads fall through to the store.

pub mod postgres;
pub mod store;

pub use postgres::PgProgressStore;
pub use store::{MemoryProgressStore, ProgressStore};

use crate::clock::Clock;
use crate::error::Result;
use crate::models::{ProgressUpdate, SyncPhase, SyncProgress};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    sender: broadcast::Sender<SyncProgress>,
    live: DashMap<Uuid, SyncProgress>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("live_runs", &self.live.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            sender,
            live: DashMap::new(),
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.sender.subscribe()
    }

    /// Record, persist and broadcast a progress update; returns the stored snapshot
    pub async fn update_progress(&self, sync_id: Uuid, update: ProgressUpdate) -> SyncProgress {
        let mut progress = clamp_percentage(update.progress);

        let cached = self.live.get(&sync_id).map(|entry| entry.value().clone());
        let previous = match cached {
            Some(previous) => Some(previous),
            None => self.store.get(sync_id).await.ok().flatten(),
        };
        if let Some(previous) = previous.filter(|p| p.phase == update.phase) {
            if progress < previous.progress {
                debug!(
                    sync_id = %sync_id,
                    phase = %update.phase,
                    requested = progress,
                    kept = previous.progress,
                    "Progress regression clamped"
                );
                progress = previous.progress;
            }
        }

        let snapshot = SyncProgress {
            sync_id,
            phase: update.phase,
            progress,
            message: update.message,
            details: update.details,
            last_update: self.clock.now(),
        };

        if let Err(e) = self.store.upsert(&snapshot).await {
            warn!(sync_id = %sync_id, error = %e, "Failed to persist sync progress");
        }
        self.live.insert(sync_id, snapshot.clone());

        // No subscribers is not an error
        let _ = self.sender.send(snapshot.clone());
        snapshot
    }

    pub async fn get_progress(&self, sync_id: Uuid) -> Result<Option<SyncProgress>> {
        let cached = self.live.get(&sync_id).map(|entry| entry.value().clone());
        match cached {
            Some(progress) => Ok(Some(progress)),
            None => self.store.get(sync_id).await,
        }
    }

    /// Mark `phase` as done (100%)
    pub async fn complete_phase(
        &self,
        sync_id: Uuid,
        phase: SyncPhase,
        message: impl Into<String>,
    ) -> SyncProgress {
        self.update_progress(sync_id, ProgressUpdate::new(phase, 100.0, message))
            .await
    }

    /// Drop the cached snapshot of a finished run; the stored copy stays
    pub fn release(&self, sync_id: Uuid) -> bool {
        self.live.remove(&sync_id).is_some()
    }

    /// Runs with a cached snapshot
    pub fn live_runs(&self) -> usize {
        self.live.len()
    }

    pub async fn clear_progress(&self, sync_id: Uuid) -> Result<bool> {
        let cached = self.live.remove(&sync_id).is_some();
        let stored = self.store.delete(sync_id).await?;
        Ok(cached || stored)
    }

    pub async fn list_active(&self) -> Result<Vec<SyncProgress>> {
        self.store.list_active().await
    }
}
