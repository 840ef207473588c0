//! Engine constants. All monetary values in nanotons (1 TON = 10^9 nanotons).

/// One TON in nanotons.
pub const TON: u64 = 1_000_000_000;

/// Fixed-point denominator for rates: 10^9 ppb = 100%.
pub const RATE_PRECISION: u64 = 1_000_000_000;

/// Parts-per-billion in one percent.
pub const PPB_PER_PERCENT: u64 = RATE_PRECISION / 100;

/// Fixed-point denominator for multipliers and ratios: 10_000 bps = 1.0x.
pub const BPS_PRECISION: u64 = 10_000;

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const HOURS_PER_DAY: i64 = 24;

/// Highest cycle completion percentage a position may be configured with.
pub const MAX_CYCLE_COMPLETION_PCT: u64 = 300;

// --- Rate defaults ---

/// Default base tiers as `(min_principal, daily_rate_ppb)`.
///
/// | Principal   | Daily rate |
/// |-------------|------------|
/// | >= 1000 TON | 2.5%       |
/// | >= 500 TON  | 2.0%       |
/// | >= 100 TON  | 1.5%       |
/// | >= 10 TON   | 1.2%       |
/// | >= 0        | 1.0%       |
pub const DEFAULT_BASE_TIERS: [(u64, u64); 5] = [
    (1_000 * TON, 25 * PPB_PER_PERCENT / 10),
    (500 * TON, 2 * PPB_PER_PERCENT),
    (100 * TON, 15 * PPB_PER_PERCENT / 10),
    (10 * TON, 12 * PPB_PER_PERCENT / 10),
    (0, PPB_PER_PERCENT),
];

/// Duration bonus: +0.01% per day staked.
pub const DEFAULT_DURATION_BONUS_PER_DAY_PPB: u64 = PPB_PER_PERCENT / 100;

/// Duration bonus ceiling: +0.5%.
pub const DEFAULT_DURATION_BONUS_CAP_PPB: u64 = PPB_PER_PERCENT / 2;

/// Default rank bonuses as `(rank, ppb)`; applied as `rate *= 1 + bonus`.
pub const DEFAULT_RANK_BONUSES: [(&str, u64); 4] = [
    ("bronze", 5 * PPB_PER_PERCENT),
    ("silver", 10 * PPB_PER_PERCENT),
    ("gold", 20 * PPB_PER_PERCENT),
    ("platinum", 30 * PPB_PER_PERCENT),
];

/// Speed boost: 1.5x reward.
pub const DEFAULT_SPEED_BOOST_MULTIPLIER_BPS: u64 = 15_000;

/// Daily reward may never exceed 5% of principal.
pub const DEFAULT_ABSOLUTE_CAP_PPB: u64 = 5 * PPB_PER_PERCENT;

/// Daily reward may never exceed 10,000 TON.
pub const DEFAULT_ABSOLUTE_CAP_AMOUNT: u64 = 10_000 * TON;

// --- Settlement defaults ---

pub const DEFAULT_MAX_BACKLOG_DAYS: u64 = 7;
pub const DEFAULT_DISTRIBUTION_INTERVAL_HOURS: u64 = 24;
pub const DEFAULT_CYCLE_COMPLETION_PCT: u64 = 300;

/// Reinvestment credit on cycle completion: 10% of principal.
pub const DEFAULT_REINVEST_RATIO_BPS: u64 = 1_000;

/// Display list length kept per owner by the activity recorder.
pub const DEFAULT_ACTIVITY_RETENTION: usize = 200;
