use crate::models::SyncPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Live progress snapshot of one sync run. Advisory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub sync_id: Uuid,
    pub phase: SyncPhase,
    /// Percentage in `[0, 100]`
    pub progress: f64,
    pub message: String,
    pub details: Value,
    pub last_update: DateTime<Utc>,
}

/// Requested change to a run's progress
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: SyncPhase,
    pub progress: f64,
    pub message: String,
    pub details: Value,
}

impl ProgressUpdate {
    pub fn new(phase: SyncPhase, progress: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            progress,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}
