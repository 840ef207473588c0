//! Rate and settlement configuration shared by the rate engine and the
//! batch distributor.
//!
//! Both structs deserialize with `#[serde(default)]`, so a config file only
//! needs to name the values it overrides. Call `validate()` at startup; a
//! [`ValidationError`] is fatal and never retried.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ValidationError;

/// One step of the base rate function.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tier {
    /// Inclusive lower bound on principal, nanotons.
    pub min_principal: u64,
    pub daily_rate_ppb: u64,
}

/// Inputs of the daily reward computation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RateConfig {
    pub base_tiers: Vec<Tier>,
    pub duration_bonus_per_day_ppb: u64,
    pub duration_bonus_cap_ppb: u64,
    pub rank_bonus_ppb: BTreeMap<String, u64>,
    pub speed_boost_multiplier_bps: u64,
    /// Daily reward cap as a fraction of principal.
    pub absolute_cap_ppb: u64,
    /// Daily reward cap in nanotons.
    pub absolute_cap_amount: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            base_tiers: DEFAULT_BASE_TIERS
                .iter()
                .map(|&(min_principal, daily_rate_ppb)| Tier { min_principal, daily_rate_ppb })
                .collect(),
            duration_bonus_per_day_ppb: DEFAULT_DURATION_BONUS_PER_DAY_PPB,
            duration_bonus_cap_ppb: DEFAULT_DURATION_BONUS_CAP_PPB,
            rank_bonus_ppb: DEFAULT_RANK_BONUSES
                .iter()
                .map(|&(rank, ppb)| (rank.to_string(), ppb))
                .collect(),
            speed_boost_multiplier_bps: DEFAULT_SPEED_BOOST_MULTIPLIER_BPS,
            absolute_cap_ppb: DEFAULT_ABSOLUTE_CAP_PPB,
            absolute_cap_amount: DEFAULT_ABSOLUTE_CAP_AMOUNT,
        }
    }
}

impl RateConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_tiers.is_empty() {
            return Err(ValidationError::NoTiers);
        }
        let mut seen = std::collections::BTreeSet::new();
        for tier in &self.base_tiers {
            if !seen.insert(tier.min_principal) {
                return Err(ValidationError::DuplicateTier(tier.min_principal));
            }
            if tier.daily_rate_ppb > RATE_PRECISION {
                return Err(ValidationError::TierRateTooHigh { rate_ppb: tier.daily_rate_ppb });
            }
        }
        if self.duration_bonus_per_day_ppb > self.duration_bonus_cap_ppb {
            return Err(ValidationError::DurationCap {
                per_day: self.duration_bonus_per_day_ppb,
                cap: self.duration_bonus_cap_ppb,
            });
        }
        if self.speed_boost_multiplier_bps < BPS_PRECISION {
            return Err(ValidationError::BoostMultiplier(self.speed_boost_multiplier_bps));
        }
        if self.absolute_cap_ppb == 0 || self.absolute_cap_amount == 0 {
            return Err(ValidationError::ZeroCap);
        }
        if self.absolute_cap_ppb > RATE_PRECISION {
            return Err(ValidationError::CapTooHigh(self.absolute_cap_ppb));
        }
        Ok(())
    }

    /// Tiers ordered by threshold, highest first.
    pub fn tiers_descending(&self) -> Vec<Tier> {
        let mut tiers = self.base_tiers.clone();
        tiers.sort_by(|a, b| b.min_principal.cmp(&a.min_principal));
        tiers
    }

    /// The smaller of the two absolute caps for `principal`.
    pub fn absolute_cap(&self, principal: u64) -> u64 {
        let pct_cap = principal as u128 * self.absolute_cap_ppb as u128 / RATE_PRECISION as u128;
        pct_cap.min(self.absolute_cap_amount as u128) as u64
    }
}

/// Inputs of the periodic settlement job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_backlog_days: u64,
    pub distribution_interval_hours: u64,
    pub cycle_completion_pct: u64,
    pub reinvest_ratio_bps: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_backlog_days: DEFAULT_MAX_BACKLOG_DAYS,
            distribution_interval_hours: DEFAULT_DISTRIBUTION_INTERVAL_HOURS,
            cycle_completion_pct: DEFAULT_CYCLE_COMPLETION_PCT,
            reinvest_ratio_bps: DEFAULT_REINVEST_RATIO_BPS,
        }
    }
}

impl SettlementConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_backlog_days == 0 {
            return Err(ValidationError::ZeroBacklog);
        }
        if self.distribution_interval_hours == 0 {
            return Err(ValidationError::ZeroInterval);
        }
        if self.cycle_completion_pct == 0 || self.cycle_completion_pct > MAX_CYCLE_COMPLETION_PCT {
            return Err(ValidationError::CompletionPct(self.cycle_completion_pct));
        }
        if self.reinvest_ratio_bps > BPS_PRECISION {
            return Err(ValidationError::ReinvestRatio(self.reinvest_ratio_bps));
        }
        Ok(())
    }

    pub fn distribution_interval(&self) -> Duration {
        Duration::hours(self.distribution_interval_hours as i64)
    }

    /// Completion threshold as cycle progress in ppb.
    pub fn completion_ppb(&self) -> u64 {
        self.cycle_completion_pct * PPB_PER_PERCENT
    }

    /// Maximum lifetime earnings of a position with `principal`.
    pub fn earnings_ceiling(&self, principal: u64) -> u64 {
        let ceiling = principal as u128 * self.cycle_completion_pct as u128 / 100;
        ceiling.min(u64::MAX as u128) as u64
    }

    /// One-time credit issued when a position completes its cycle.
    pub fn reinvestment_credit(&self, principal: u64) -> u64 {
        (principal as u128 * self.reinvest_ratio_bps as u128 / BPS_PRECISION as u128) as u64
    }
}
