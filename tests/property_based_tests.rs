use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

use crm_sync::models::{content_hash, CrmRecord, RecordKind, SyncPeriod};
use crm_sync::resilience::{BackoffCalculator, BackoffConfig};

fn period_strategy() -> impl Strategy<Value = SyncPeriod> {
    (2000i32..2100, 1u32..=12).prop_map(|(year, month)| SyncPeriod::new(year, month).unwrap())
}

#[test]
fn backoff_schedule_is_non_decreasing_and_capped_by_retry_budget() {
    let max_retries = 3;
    let base = Duration::from_millis(1000);
    let calculator = BackoffCalculator::new(BackoffConfig {
        base_delay: base,
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
        jitter_enabled: false,
        max_jitter: 0.0,
    });

    let delays: Vec<Duration> = (0..=max_retries)
        .map(|attempt| calculator.delay_for_attempt(attempt))
        .collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= base * 2u32.pow(max_retries)));
    assert_eq!(delays[0], base);
}

proptest! {
    /// Property: stepping a month forward then back is the identity
    #[test]
    fn next_and_previous_are_inverse(period in period_strategy()) {
        prop_assert_eq!(period.next().previous(), period);
        prop_assert_eq!(period.previous().next(), period);
        prop_assert!(period.next() > period);
    }

    /// Property: the historical month range is contiguous and sized by month distance
    #[test]
    fn range_covers_every_month(start in period_strategy(), span in 0u32..60) {
        let mut end = start;
        for _ in 0..span {
            end = end.next();
        }
        let months = SyncPeriod::range_inclusive(start, end);
        prop_assert_eq!(months.len(), span as usize + 1);
        prop_assert_eq!(months.first().copied(), Some(start));
        prop_assert_eq!(months.last().copied(), Some(end));
        prop_assert!(months.windows(2).all(|w| w[0].next() == w[1]));
    }

    /// Property: jittered backoff never exceeds the cap and never undercuts the base schedule
    #[test]
    fn backoff_stays_within_bounds(
        attempt in 0u32..40,
        base_ms in 1u64..5_000,
        max_ms in 5_000u64..600_000,
        jitter in 0.0f64..=1.0,
    ) {
        let calculator = BackoffCalculator::new(BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: jitter,
        });
        let delay = calculator.delay_for_attempt(attempt);
        prop_assert!(delay <= Duration::from_millis(max_ms));
        prop_assert!(delay >= calculator.base_delay_for_attempt(attempt));
    }

    /// Property: the content hash ignores object key order
    #[test]
    fn content_hash_is_key_order_independent(
        mid in "[A-Z][0-9]{4}",
        volume in 0i64..10_000_000,
        status in "(active|closed|pending)",
    ) {
        let forward = json!({"merchant_number": mid, "volume": volume, "status": status});
        let mut reversed = serde_json::Map::new();
        reversed.insert("status".into(), json!(status));
        reversed.insert("volume".into(), json!(volume));
        reversed.insert("merchant_number".into(), json!(mid));
        prop_assert_eq!(content_hash(&forward), content_hash(&serde_json::Value::Object(reversed)));
    }

    /// Property: monthly records are keyed by merchant and period
    #[test]
    fn monthly_natural_key_includes_period(mid in "[A-Z][0-9]{4}", period in period_strategy()) {
        let record = CrmRecord::from_payload(
            RecordKind::Residual,
            json!({"merchant_number": mid, "net_residual": 1.5}),
            Some(period),
        ).unwrap();
        prop_assert_eq!(record.natural_key, format!("{mid}:{period}"));
        prop_assert_eq!(record.merchant_number, mid);
    }
}
