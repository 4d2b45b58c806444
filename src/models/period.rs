use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A calendar month, the unit residuals and transaction volumes are reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncPeriod {
    pub year: i32,
    pub month: u32,
}

impl SyncPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// Every month from `start` through `end`, inclusive
    pub fn range_inclusive(start: SyncPeriod, end: SyncPeriod) -> Vec<SyncPeriod> {
        let mut months = Vec::new();
        let mut current = start;
        while current <= end {
            months.push(current);
            current = current.next();
        }
        months
    }
}

impl fmt::Display for SyncPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_arithmetic_wraps_years() {
        let dec = SyncPeriod::new(2024, 12).unwrap();
        assert_eq!(dec.next(), SyncPeriod::new(2025, 1).unwrap());
        assert_eq!(dec.next().previous(), dec);
        assert!(SyncPeriod::new(2024, 13).is_none());
    }

    #[test]
    fn test_range_inclusive() {
        let months = SyncPeriod::range_inclusive(
            SyncPeriod::new(2024, 11).unwrap(),
            SyncPeriod::new(2025, 2).unwrap(),
        );
        let labels: Vec<String> = months.iter().map(ToString::to_string).collect();
        assert_eq!(labels, vec!["2024-11", "2024-12", "2025-01", "2025-02"]);
    }
}
