use crate::error::{Result, SyncError};
use crate::models::SyncPhase;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Phase bookkeeping for one sync run. Every move is checked against
/// [`SyncPhase::can_transition_to`].
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    sync_id: Uuid,
    current: SyncPhase,
    transitions: Vec<(SyncPhase, DateTime<Utc>)>,
}

impl RunStateMachine {
    pub fn new(sync_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            sync_id,
            current: SyncPhase::Initializing,
            transitions: vec![(SyncPhase::Initializing, started_at)],
        }
    }

    pub fn current(&self) -> SyncPhase {
        self.current
    }

    pub fn transitions(&self) -> &[(SyncPhase, DateTime<Utc>)] {
        &self.transitions
    }

    pub fn transition(&mut self, next: SyncPhase, at: DateTime<Utc>) -> Result<SyncPhase> {
        if !self.current.can_transition_to(next) {
            return Err(SyncError::InvalidTransition(format!(
                "sync {}: {} -> {}",
                self.sync_id, self.current, next
            )));
        }
        debug!(sync_id = %self.sync_id, from = %self.current, to = %next, "Sync phase transition");
        self.current = next;
        self.transitions.push((next, at));
        Ok(next)
    }

    /// Move to `Failed` from any non-terminal phase; a no-op once terminal
    pub fn fail(&mut self, at: DateTime<Utc>) {
        if !self.current.is_terminal() {
            self.current = SyncPhase::Failed;
            self.transitions.push((SyncPhase::Failed, at));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historical_walk() {
        let now = Utc::now();
        let mut sm = RunStateMachine::new(Uuid::new_v4(), now);
        for phase in [
            SyncPhase::SyncingMerchants,
            SyncPhase::SyncingTransactions,
            SyncPhase::SyncingResiduals,
            SyncPhase::SyncingTransactions,
            SyncPhase::SyncingResiduals,
            SyncPhase::RefreshingViews,
            SyncPhase::Completed,
        ] {
            sm.transition(phase, now).unwrap();
        }
        assert_eq!(sm.current(), SyncPhase::Completed);
        assert_eq!(sm.transitions().len(), 8);
    }

    #[test]
    fn test_rejects_backwards_and_post_terminal_moves() {
        let now = Utc::now();
        let mut sm = RunStateMachine::new(Uuid::new_v4(), now);
        sm.transition(SyncPhase::RefreshingViews, now).unwrap();
        let err = sm.transition(SyncPhase::SyncingMerchants, now).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition(_)));

        sm.fail(now);
        assert_eq!(sm.current(), SyncPhase::Failed);
        assert!(sm.transition(SyncPhase::Completed, now).is_err());
        sm.fail(now);
        assert_eq!(sm.transitions().len(), 3);
    }
}
