use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Phase of a sync run, in the order the orchestrator walks through them.
///
/// Monthly phases may repeat (one entry per month), and a historical run
/// alternates between transactions and residuals as it advances through months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Initializing,
    SyncingMerchants,
    SyncingTransactions,
    SyncingResiduals,
    RefreshingViews,
    Completed,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Initializing => "initializing",
            SyncPhase::SyncingMerchants => "syncing_merchants",
            SyncPhase::SyncingTransactions => "syncing_transactions",
            SyncPhase::SyncingResiduals => "syncing_residuals",
            SyncPhase::RefreshingViews => "refreshing_views",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::Completed | SyncPhase::Failed)
    }

    /// Whether a run may move from `self` to `next`
    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        use SyncPhase::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }

        match (self, next) {
            (Initializing, SyncingMerchants | SyncingTransactions | SyncingResiduals) => true,
            (Initializing, RefreshingViews | Completed) => true,
            (SyncingMerchants, SyncingTransactions | SyncingResiduals | RefreshingViews | Completed) => {
                true
            }
            (SyncingTransactions, SyncingTransactions | SyncingResiduals) => true,
            (SyncingTransactions, RefreshingViews | Completed) => true,
            (SyncingResiduals, SyncingResiduals | SyncingTransactions) => true,
            (SyncingResiduals, RefreshingViews | Completed) => true,
            (RefreshingViews, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SyncPhase::Initializing),
            "syncing_merchants" => Ok(SyncPhase::SyncingMerchants),
            "syncing_transactions" => Ok(SyncPhase::SyncingTransactions),
            "syncing_residuals" => Ok(SyncPhase::SyncingResiduals),
            "refreshing_views" => Ok(SyncPhase::RefreshingViews),
            "completed" => Ok(SyncPhase::Completed),
            "failed" => Ok(SyncPhase::Failed),
            other => Err(format!("unknown sync phase: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historical_walk_is_valid() {
        let walk = [
            SyncPhase::Initializing,
            SyncPhase::SyncingMerchants,
            SyncPhase::SyncingTransactions,
            SyncPhase::SyncingResiduals,
            SyncPhase::SyncingTransactions,
            SyncPhase::SyncingResiduals,
            SyncPhase::RefreshingViews,
            SyncPhase::Completed,
        ];
        for pair in walk.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_phases_are_final() {
        assert!(!SyncPhase::Completed.can_transition_to(SyncPhase::Failed));
        assert!(!SyncPhase::Failed.can_transition_to(SyncPhase::Initializing));
        assert!(!SyncPhase::RefreshingViews.can_transition_to(SyncPhase::SyncingMerchants));
        assert!(SyncPhase::SyncingMerchants.can_transition_to(SyncPhase::Failed));
    }

    #[test]
    fn test_round_trips_through_str() {
        assert_eq!(
            "refreshing_views".parse::<SyncPhase>(),
            Ok(SyncPhase::RefreshingViews)
        );
        assert!("bogus".parse::<SyncPhase>().is_err());
    }
}
