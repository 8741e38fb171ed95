//! Exponential-backoff retry policy.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::operation::Operation;

/// Outcome of a failure: schedule a retry or give up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        retry_count: u32,
        delay: Duration,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the operation is failed permanently.
    GiveUp,
}

/// Computes backoff schedules from a configured ascending interval table.
///
/// The table's last entry acts as the delay ceiling, so total retry duration
/// stays bounded while still riding out transient network blips.
#[derive(Debug, Clone)]
pub struct RetryManager {
    intervals: Vec<Duration>,
}

impl RetryManager {
    pub fn new(intervals_ms: &[u64]) -> Self {
        debug_assert!(!intervals_ms.is_empty());
        Self {
            intervals: intervals_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        }
    }

    /// Base delay before the `retry_number`-th retry (1-based).
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        let index = (retry_number.saturating_sub(1) as usize).min(self.intervals.len() - 1);
        self.intervals[index]
    }

    /// Decide what to do after a failed attempt.
    ///
    /// The network-quality multiplier stretches delays on degraded links so
    /// retries shed load instead of amplifying congestion.
    pub fn on_failure(&self, op: &Operation, quality_multiplier: f64, now: DateTime<Utc>) -> RetryDecision {
        if op.retry_count >= op.max_retries {
            return RetryDecision::GiveUp;
        }

        let retry_count = op.retry_count + 1;
        let delay = self.delay_for(retry_count).mul_f64(quality_multiplier.max(1.0));
        let next_attempt_at =
            now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::milliseconds(i64::MAX / 1000));

        RetryDecision::Retry {
            retry_count,
            delay,
            next_attempt_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationSpec;
    use proptest::prelude::*;

    fn failed_op(retry_count: u32, max_retries: u32) -> Operation {
        let mut op = Operation::from_spec(OperationSpec::new("document", "upload"), max_retries);
        op.retry_count = retry_count;
        op
    }

    #[test]
    fn test_delay_table_lookup() {
        let manager = RetryManager::new(&[1000, 2000, 5000]);
        assert_eq!(manager.delay_for(1), Duration::from_millis(1000));
        assert_eq!(manager.delay_for(2), Duration::from_millis(2000));
        assert_eq!(manager.delay_for(3), Duration::from_millis(5000));
        // Past the table, the last entry is the ceiling.
        assert_eq!(manager.delay_for(9), Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_schedule_matches_budget() {
        let manager = RetryManager::new(&[1000, 2000, 5000]);
        let now = Utc::now();

        // Three retries, then give up: 1000, 2000, 5000, permanent.
        for (count, expected_ms) in [(0u32, 1000u64), (1, 2000), (2, 5000)] {
            match manager.on_failure(&failed_op(count, 3), 1.0, now) {
                RetryDecision::Retry { retry_count, delay, next_attempt_at } => {
                    assert_eq!(retry_count, count + 1);
                    assert_eq!(delay, Duration::from_millis(expected_ms));
                    assert_eq!(next_attempt_at, now + ChronoDuration::milliseconds(expected_ms as i64));
                }
                RetryDecision::GiveUp => panic!("gave up early at retry_count={count}"),
            }
        }
        assert_eq!(manager.on_failure(&failed_op(3, 3), 1.0, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_quality_multiplier_stretches_delay() {
        let manager = RetryManager::new(&[1000]);
        let now = Utc::now();
        match manager.on_failure(&failed_op(0, 3), 2.0, now) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_millis(2000)),
            RetryDecision::GiveUp => panic!("unexpected give-up"),
        }
    }

    #[test]
    fn test_multiplier_below_one_is_clamped() {
        let manager = RetryManager::new(&[1000]);
        match manager.on_failure(&failed_op(0, 3), 0.5, Utc::now()) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_millis(1000)),
            RetryDecision::GiveUp => panic!("unexpected give-up"),
        }
    }

    proptest! {
        /// Successive retry delays are non-decreasing and never exceed the
        /// table ceiling, for any ascending interval table.
        #[test]
        fn prop_backoff_is_monotone_and_bounded(
            mut intervals in proptest::collection::vec(1u64..60_000, 1..8),
            retries in 1u32..20,
        ) {
            intervals.sort_unstable();
            let manager = RetryManager::new(&intervals);
            let ceiling = Duration::from_millis(*intervals.last().unwrap());

            let mut previous = Duration::ZERO;
            for retry in 1..=retries {
                let delay = manager.delay_for(retry);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= ceiling);
                previous = delay;
            }
        }
    }
}
