//! Sync outcome notifications.
//!
//! The orchestrators emit one [`SyncNotification`] per finished run. Formatting
//! and delivery (email, chat) belong to whoever implements [`NotificationSink`];
//! the default sink only logs.

use crate::models::RunStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Success,
    Partial,
    Failure,
}

impl From<RunStatus> for NotificationOutcome {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => NotificationOutcome::Success,
            RunStatus::Partial => NotificationOutcome::Partial,
            RunStatus::Running | RunStatus::Failed => NotificationOutcome::Failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncNotification {
    pub sync_id: Uuid,
    pub sync_type: String,
    pub outcome: NotificationOutcome,
    pub stats: Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &SyncNotification);
}

/// Logs each notification as a structured event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, n: &SyncNotification) {
        let duration_secs = (n.completed_at - n.started_at).num_seconds();
        match n.outcome {
            NotificationOutcome::Success => info!(
                sync_id = %n.sync_id,
                sync_type = %n.sync_type,
                duration_secs,
                stats = %n.stats,
                "🟢 Sync completed"
            ),
            NotificationOutcome::Partial => warn!(
                sync_id = %n.sync_id,
                sync_type = %n.sync_type,
                duration_secs,
                stats = %n.stats,
                error = ?n.error,
                "🟡 Sync completed with failures"
            ),
            NotificationOutcome::Failure => error!(
                sync_id = %n.sync_id,
                sync_type = %n.sync_type,
                duration_secs,
                error = ?n.error,
                "🔴 Sync failed"
            ),
        }
    }
}

/// Publishes notifications on a broadcast channel for in-process listeners
#[derive(Debug, Clone)]
pub struct BroadcastNotificationSink {
    sender: broadcast::Sender<SyncNotification>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotificationSink {
    async fn notify(&self, notification: &SyncNotification) {
        // Nobody listening is fine
        let _ = self.sender.send(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_from_run_status() {
        assert_eq!(NotificationOutcome::from(RunStatus::Completed), NotificationOutcome::Success);
        assert_eq!(NotificationOutcome::from(RunStatus::Partial), NotificationOutcome::Partial);
        assert_eq!(NotificationOutcome::from(RunStatus::Failed), NotificationOutcome::Failure);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastNotificationSink::new(4);
        let mut rx = sink.subscribe();
        let now = Utc::now();
        let notification = SyncNotification {
            sync_id: Uuid::new_v4(),
            sync_type: "daily".into(),
            outcome: NotificationOutcome::Success,
            stats: json!({"merchants": 3}),
            error: None,
            started_at: now,
            completed_at: now,
        };
        sink.notify(&notification).await;
        TracingNotificationSink.notify(&notification).await;
        assert_eq!(rx.recv().await.unwrap(), notification);
    }
}
