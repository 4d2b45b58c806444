use crate::error::Result;
use crate::logging::log_error;
use crate::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Periodically returns jobs with expired leases to the queue and deletes
/// processed jobs older than the queue's retention
pub struct LeaseSweeper {
    queue: Arc<JobQueue>,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(queue: Arc<JobQueue>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Reclaim expired leases, then prune old processed jobs. Returns the
    /// number of reclaimed jobs; a failed prune is logged and retried next tick.
    pub async fn sweep_once(&self) -> Result<usize> {
        let reclaimed = self.queue.reclaim_expired().await?;
        let max_age_days = self.queue.settings().cleanup_max_age_days;
        if let Err(e) = self.queue.cleanup(max_age_days).await {
            log_error("lease_sweeper", "cleanup", &e.to_string(), None);
        }
        Ok(reclaimed)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_seconds = self.interval.as_secs(), "Lease sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        log_error("lease_sweeper", "reclaim_expired", &e.to_string(), None);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Lease sweeper stopped");
    }
}
