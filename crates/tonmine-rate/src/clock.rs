//! Display-side balance interpolation between authoritative checkpoints.
//!
//! The estimate is `settled + rate * elapsed / 1 day`, with elapsed clamped to
//! zero under clock skew. It is never a source of truth and never mutates
//! the checkpoint it reads.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use tonmine_core::constants::SECONDS_PER_DAY;
use tonmine_core::traits::Clock;
use tonmine_core::types::EarningsCheckpoint;

const MILLIS_PER_DAY: u128 = SECONDS_PER_DAY as u128 * 1_000;

/// Estimated earnings at `now` extrapolated from `checkpoint`.
///
/// Monotonically non-decreasing in `now` for a fixed checkpoint.
pub fn current_estimate(checkpoint: &EarningsCheckpoint, now: DateTime<Utc>) -> u64 {
    if checkpoint.rate_at_checkpoint == 0 {
        return checkpoint.settled_earnings;
    }
    let elapsed_ms = (now - checkpoint.checkpoint_time).num_milliseconds().max(0) as u128;
    let accrued = checkpoint.rate_at_checkpoint as u128 * elapsed_ms / MILLIS_PER_DAY;
    let accrued = accrued.min(u64::MAX as u128) as u64;
    checkpoint.settled_earnings.saturating_add(accrued)
}

/// Ticking estimator bound to an injectable clock.
#[derive(Clone)]
pub struct AccrualClock {
    clock: Arc<dyn Clock>,
}

impl AccrualClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Estimate at the clock's current time. A missing checkpoint degrades
    /// to zero rather than failing.
    pub fn estimate_now(&self, checkpoint: Option<&EarningsCheckpoint>) -> u64 {
        checkpoint.map_or(0, |cp| current_estimate(cp, self.clock.now()))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for AccrualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccrualClock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use tonmine_core::constants::TON;
    use tonmine_core::time::ManualClock;
    use tonmine_core::types::OwnerId;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn checkpoint(settled: u64, rate: u64) -> EarningsCheckpoint {
        EarningsCheckpoint {
            owner_id: OwnerId(1),
            settled_earnings: settled,
            rate_at_checkpoint: rate,
            checkpoint_time: t0(),
        }
    }

    #[test]
    fn at_checkpoint_returns_settled() {
        assert_eq!(current_estimate(&checkpoint(5 * TON, TON), t0()), 5 * TON);
    }

    #[test]
    fn full_day_adds_full_rate() {
        let cp = checkpoint(5 * TON, 3 * TON / 2);
        assert_eq!(current_estimate(&cp, t0() + Duration::days(1)), 6_500_000_000);
    }

    #[test]
    fn half_day_interpolates() {
        let cp = checkpoint(0, 2 * TON);
        assert_eq!(current_estimate(&cp, t0() + Duration::hours(12)), TON);
    }

    #[test]
    fn clock_skew_clamps_to_settled() {
        let cp = checkpoint(7 * TON, TON);
        assert_eq!(current_estimate(&cp, t0() - Duration::hours(5)), 7 * TON);
    }

    #[test]
    fn zero_rate_is_flat() {
        let cp = checkpoint(7 * TON, 0);
        assert_eq!(current_estimate(&cp, t0() + Duration::days(30)), 7 * TON);
    }

    #[test]
    fn missing_checkpoint_degrades_to_zero() {
        let clock = AccrualClock::new(Arc::new(ManualClock::new(t0())));
        assert_eq!(clock.estimate_now(None), 0);
    }

    #[test]
    fn estimate_now_follows_injected_clock() {
        let manual = Arc::new(ManualClock::new(t0()));
        let clock = AccrualClock::new(manual.clone());
        let cp = checkpoint(0, 24 * TON);
        assert_eq!(clock.estimate_now(Some(&cp)), 0);
        manual.advance(Duration::hours(1));
        assert_eq!(clock.estimate_now(Some(&cp)), TON);
        // The checkpoint itself is untouched.
        assert_eq!(cp.settled_earnings, 0);
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let cp = checkpoint(u64::MAX - 1, u64::MAX);
        assert_eq!(current_estimate(&cp, t0() + Duration::days(10_000)), u64::MAX);
    }

    proptest! {
        #[test]
        fn monotonic_in_time(
            settled in 0u64..=1_000_000 * TON,
            rate in 0u64..=10_000 * TON,
            a in -86_400_000i64..=100 * 86_400_000,
            b in -86_400_000i64..=100 * 86_400_000,
        ) {
            let cp = checkpoint(settled, rate);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let e_lo = current_estimate(&cp, t0() + Duration::milliseconds(lo));
            let e_hi = current_estimate(&cp, t0() + Duration::milliseconds(hi));
            prop_assert!(e_lo <= e_hi);
            prop_assert!(e_lo >= settled);
        }
    }
}
