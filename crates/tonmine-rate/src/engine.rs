//! Rate engine implementing the [`RewardCalculator`] trait.
//!
//! The daily reward for a position is computed in five steps:
//! 1. base rate from the principal tier (`>=` thresholds, highest first)
//! 2. additive duration bonus, linear in days staked and capped
//! 3. rank multiplier `rate *= 1 + rank_bonus`
//! 4. speed boost applied to the floored *reward*, not the rate
//! 5. clamp to the smaller of the two absolute caps
//!
//! All arithmetic is integer-only with u128 intermediates and floor division,
//! so identical inputs always yield identical outputs.

use chrono::{DateTime, Utc};
use tracing::info;

use tonmine_core::config::{RateConfig, Tier};
use tonmine_core::constants::{BPS_PRECISION, RATE_PRECISION};
use tonmine_core::error::ValidationError;
use tonmine_core::traits::RewardCalculator;
use tonmine_core::types::{Position, RewardQuote};

/// The production reward calculator.
#[derive(Debug, Clone)]
pub struct RateEngine {
    config: RateConfig,
    /// Tiers sorted by threshold, highest first.
    tiers: Vec<Tier>,
}

impl Default for RateEngine {
    fn default() -> Self {
        let config = RateConfig::default();
        let tiers = config.tiers_descending();
        Self { config, tiers }
    }
}

impl RateEngine {
    /// Create an engine after validating `config`.
    pub fn new(config: RateConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        let tiers = config.tiers_descending();
        Ok(Self { config, tiers })
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    /// Base daily rate for `principal`. Zero below every threshold.
    pub fn base_rate_ppb(&self, principal: u64) -> u64 {
        self.tiers
            .iter()
            .find(|tier| principal >= tier.min_principal)
            .map(|tier| tier.daily_rate_ppb)
            .unwrap_or(0)
    }

    /// Additive bonus for having staked `days_staked` days.
    pub fn duration_bonus_ppb(&self, days_staked: u64) -> u64 {
        days_staked
            .saturating_mul(self.config.duration_bonus_per_day_ppb)
            .min(self.config.duration_bonus_cap_ppb)
    }

    /// Rank bonus fraction; unknown or missing ranks get none.
    pub fn rank_bonus_ppb(&self, rank: Option<&str>) -> u64 {
        rank.and_then(|r| self.config.rank_bonus_ppb.get(r))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of capped daily rewards over the active positions, as of `now`.
    ///
    /// This is the rate an accrual checkpoint extrapolates with.
    pub fn aggregate_daily_reward<'a>(
        &self,
        positions: impl IntoIterator<Item = &'a Position>,
        now: DateTime<Utc>,
    ) -> u64 {
        positions
            .into_iter()
            .filter(|p| p.is_active)
            .map(|p| {
                self.compute_daily_reward(
                    p.principal,
                    p.days_staked(now),
                    p.rank.as_deref(),
                    p.speed_boost_active,
                )
                .daily_reward
            })
            .fold(0u64, u64::saturating_add)
    }
}

fn saturate(value: u128) -> u64 {
    value.min(u64::MAX as u128) as u64
}

impl RewardCalculator for RateEngine {
    fn compute_daily_reward(
        &self,
        principal: u64,
        days_staked: u64,
        rank: Option<&str>,
        speed_boost_active: bool,
    ) -> RewardQuote {
        let base_rate_ppb = self.base_rate_ppb(principal);
        let duration_bonus_ppb = self.duration_bonus_ppb(days_staked);
        let rank_bonus_ppb = self.rank_bonus_ppb(rank);

        // rate = (base + duration) * (1 + rank_bonus)
        let pre_rank = base_rate_ppb as u128 + duration_bonus_ppb as u128;
        let daily_rate_ppb = saturate(
            pre_rank * (RATE_PRECISION as u128 + rank_bonus_ppb as u128) / RATE_PRECISION as u128,
        );

        // reward = principal * rate, floored before the boost is applied
        let mut reward = principal as u128 * daily_rate_ppb as u128 / RATE_PRECISION as u128;
        if speed_boost_active {
            reward = reward * self.config.speed_boost_multiplier_bps as u128 / BPS_PRECISION as u128;
        }
        let uncapped_reward = saturate(reward);

        let cap = self.absolute_cap(principal);
        let daily_reward = uncapped_reward.min(cap);
        if daily_reward < uncapped_reward {
            info!(principal, uncapped_reward, cap, "daily reward clamped by absolute cap");
        }

        RewardQuote {
            base_rate_ppb,
            duration_bonus_ppb,
            rank_bonus_ppb,
            daily_rate_ppb,
            speed_boost_applied: speed_boost_active,
            uncapped_reward,
            daily_reward,
        }
    }

    fn absolute_cap(&self, principal: u64) -> u64 {
        self.config.absolute_cap(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tonmine_core::constants::{PPB_PER_PERCENT, TON};

    fn engine() -> RateEngine {
        RateEngine::default()
    }

    /// Default tiers with the duration bonus switched off.
    fn flat_engine() -> RateEngine {
        RateEngine::new(RateConfig {
            duration_bonus_per_day_ppb: 0,
            duration_bonus_cap_ppb: 0,
            ..RateConfig::default()
        })
        .unwrap()
    }

    // --- base tiers ---

    #[test]
    fn hundred_ton_earns_one_and_a_half_percent() {
        let quote = flat_engine().compute_daily_reward(100 * TON, 0, None, false);
        assert_eq!(quote.base_rate_ppb, 15 * PPB_PER_PERCENT / 10);
        assert_eq!(quote.daily_reward, 1_500_000_000);
    }

    #[test]
    fn tier_threshold_ties_resolve_upward() {
        let e = engine();
        assert_eq!(e.base_rate_ppb(500 * TON), 2 * PPB_PER_PERCENT);
        assert_eq!(e.base_rate_ppb(500 * TON - 1), 15 * PPB_PER_PERCENT / 10);
    }

    #[test]
    fn base_rate_monotonic_in_principal() {
        let e = engine();
        let mut last = 0;
        for principal in [0, TON, 10 * TON, 99 * TON, 100 * TON, 500 * TON, 5_000 * TON] {
            let rate = e.base_rate_ppb(principal);
            assert!(rate >= last, "rate fell at {principal}");
            last = rate;
        }
    }

    #[test]
    fn below_every_tier_earns_nothing() {
        let e = RateEngine::new(RateConfig {
            base_tiers: vec![Tier { min_principal: 10 * TON, daily_rate_ppb: PPB_PER_PERCENT }],
            ..RateConfig::default()
        })
        .unwrap();
        assert_eq!(e.compute_daily_reward(TON, 30, None, false).daily_reward, 0);
    }

    // --- duration bonus ---

    #[test]
    fn duration_bonus_linear_then_capped() {
        let e = engine();
        let per_day = e.config().duration_bonus_per_day_ppb;
        let cap = e.config().duration_bonus_cap_ppb;
        assert_eq!(e.duration_bonus_ppb(0), 0);
        assert_eq!(e.duration_bonus_ppb(10), 10 * per_day);
        assert_eq!(e.duration_bonus_ppb(10_000), cap);
        assert_eq!(e.duration_bonus_ppb(u64::MAX), cap);
    }

    // --- rank ---

    #[test]
    fn rank_multiplies_rate() {
        let e = flat_engine();
        let unranked = e.compute_daily_reward(100 * TON, 0, None, false);
        let gold = e.compute_daily_reward(100 * TON, 0, Some("gold"), false);
        // 1.5% * 1.2 = 1.8%
        assert_eq!(gold.daily_rate_ppb, 18 * PPB_PER_PERCENT / 10);
        assert_eq!(gold.daily_reward, 1_800_000_000);
        assert!(gold.daily_reward > unranked.daily_reward);
    }

    #[test]
    fn unknown_rank_is_unranked() {
        let e = flat_engine();
        assert_eq!(
            e.compute_daily_reward(100 * TON, 0, Some("diamond"), false),
            e.compute_daily_reward(100 * TON, 0, None, false)
        );
    }

    // --- speed boost ---

    #[test]
    fn speed_boost_multiplies_reward() {
        let quote = flat_engine().compute_daily_reward(100 * TON, 0, None, true);
        assert_eq!(quote.daily_reward, 2_250_000_000);
        assert!(quote.speed_boost_applied);
        // The rate itself is not boosted.
        assert_eq!(quote.daily_rate_ppb, 15 * PPB_PER_PERCENT / 10);
    }

    #[test]
    fn speed_boost_applies_to_floored_reward() {
        // 127 nanotons at 1.5%: reward floors to 1, boosted 1 * 1.5 floors to 1.
        // Boosting the rate first would give floor(2.8575) = 2.
        let e = RateEngine::new(RateConfig {
            base_tiers: vec![Tier { min_principal: 0, daily_rate_ppb: 15 * PPB_PER_PERCENT / 10 }],
            duration_bonus_per_day_ppb: 0,
            duration_bonus_cap_ppb: 0,
            ..RateConfig::default()
        })
        .unwrap();
        assert_eq!(e.compute_daily_reward(127, 0, None, true).daily_reward, 1);
    }

    // --- caps ---

    #[test]
    fn percentage_cap_clamps() {
        let e = RateEngine::new(RateConfig {
            absolute_cap_ppb: PPB_PER_PERCENT,
            ..RateConfig::default()
        })
        .unwrap();
        let quote = e.compute_daily_reward(100 * TON, 0, None, true);
        assert_eq!(quote.daily_reward, TON);
        assert!(quote.was_capped());
    }

    #[test]
    fn amount_cap_clamps_large_principal() {
        let e = engine();
        let quote = e.compute_daily_reward(10_000_000 * TON, 365, Some("platinum"), true);
        assert_eq!(quote.daily_reward, e.config().absolute_cap_amount);
    }

    #[test]
    fn zero_principal_earns_nothing() {
        assert_eq!(engine().compute_daily_reward(0, 10, Some("gold"), true).daily_reward, 0);
    }

    // --- aggregate ---

    #[test]
    fn aggregate_skips_inactive() {
        use chrono::TimeZone;
        use tonmine_core::types::{OwnerId, PositionId};

        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let make = |id, active| Position {
            id: PositionId(id),
            owner_id: OwnerId(1),
            principal: 100 * TON,
            created_at: now,
            last_distribution_at: now,
            settled_earnings: 0,
            cycle_progress_ppb: 0,
            is_active: active,
            speed_boost_active: false,
            rank: None,
            version: 0,
        };
        let positions = [make(1, true), make(2, false), make(3, true)];
        assert_eq!(flat_engine().aggregate_daily_reward(&positions, now), 3 * TON);
    }

    #[test]
    fn engine_is_object_safe() {
        let e = engine();
        let dyn_e: &dyn RewardCalculator = &e;
        assert_eq!(dyn_e.absolute_cap(100 * TON), 5 * TON);
    }

    #[test]
    fn invalid_config_rejected() {
        let err = RateEngine::new(RateConfig { base_tiers: vec![], ..RateConfig::default() });
        assert_eq!(err.unwrap_err(), ValidationError::NoTiers);
    }

    // --- proptest ---

    proptest! {
        #[test]
        fn deterministic(
            principal in 0u64..=1_000_000 * TON,
            days in 0u64..=5_000,
            rank in prop::option::of(prop::sample::select(vec!["bronze", "silver", "gold", "platinum", "none"])),
            boost in any::<bool>(),
        ) {
            let a = engine().compute_daily_reward(principal, days, rank, boost);
            let b = engine().compute_daily_reward(principal, days, rank, boost);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn never_exceeds_absolute_cap(
            principal in 0u64..=u64::MAX / 2,
            days in 0u64..=u64::MAX,
            rank in prop::option::of(prop::sample::select(vec!["bronze", "silver", "gold", "platinum"])),
            boost in any::<bool>(),
        ) {
            let e = engine();
            let quote = e.compute_daily_reward(principal, days, rank, boost);
            prop_assert!(quote.daily_reward <= e.config().absolute_cap_amount);
            prop_assert!(quote.daily_reward <= e.absolute_cap(principal));
            prop_assert!(quote.daily_reward <= quote.uncapped_reward);
        }

        #[test]
        fn reward_monotonic_in_days(
            principal in 0u64..=10_000 * TON,
            a in 0u64..=1_000,
            b in 0u64..=1_000,
        ) {
            let e = engine();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let r_lo = e.compute_daily_reward(principal, lo, None, false).daily_reward;
            let r_hi = e.compute_daily_reward(principal, hi, None, false).daily_reward;
            prop_assert!(r_lo <= r_hi);
        }
    }
}
