//! Core data model: positions, checkpoints, ledger entries, history and
//! activity records.
//!
//! Amounts are nanotons (`u64`), rates are parts-per-billion of principal per
//! day, multipliers are basis points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{PPB_PER_PERCENT, RATE_PRECISION};

/// Identifier of a stake position.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PositionId(pub u64);

/// Identifier of a position owner (the Telegram user).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct OwnerId(pub u64);

/// Device-local, monotonically increasing identifier of a ledger entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LocalId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    )*};
}

display_id!(PositionId, OwnerId, LocalId);

/// Identifier of the device (ledger database) an offline entry came from.
///
/// `LocalId`s are only unique within one device, so anything the store
/// remembers about applied entries is keyed by device.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A stake. Mutated only by the batch distributor and the store's own
/// deposit/boost operations; never deleted, only deactivated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Position {
    pub id: PositionId,
    pub owner_id: OwnerId,
    /// Staked amount in nanotons. Positive while active.
    pub principal: u64,
    pub created_at: DateTime<Utc>,
    pub last_distribution_at: DateTime<Utc>,
    /// Rewards settled so far, in nanotons.
    pub settled_earnings: u64,
    /// `settled_earnings / principal` in ppb, capped at the completion
    /// percentage (300% = 3 * 10^9).
    pub cycle_progress_ppb: u64,
    pub is_active: bool,
    pub speed_boost_active: bool,
    /// Rank the position earns under; `None` for unranked owners.
    pub rank: Option<String>,
    /// Optimistic concurrency counter, bumped on every mutation.
    #[serde(default)]
    pub version: u64,
}

impl Position {
    /// Whole percent of the payout cycle completed.
    pub fn cycle_progress_pct(&self) -> u64 {
        self.cycle_progress_ppb / PPB_PER_PERCENT
    }

    /// Whole days between creation and `now` (0 if `now` precedes creation).
    pub fn days_staked(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_days().max(0) as u64
    }
}

/// Cycle progress in ppb for the given earnings, capped at `ceiling_ppb`.
pub fn cycle_progress_ppb(settled_earnings: u64, principal: u64, ceiling_ppb: u64) -> u64 {
    if principal == 0 {
        return ceiling_ppb;
    }
    let ppb = settled_earnings as u128 * RATE_PRECISION as u128 / principal as u128;
    ppb.min(ceiling_ppb as u128) as u64
}

/// The last authoritative earnings value plus the rate to extrapolate from.
///
/// Replaced wholesale on every successful reconciliation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EarningsCheckpoint {
    pub owner_id: OwnerId,
    pub settled_earnings: u64,
    /// Aggregate daily reward across the owner's active positions, nanotons/day.
    pub rate_at_checkpoint: u64,
    pub checkpoint_time: DateTime<Utc>,
}

impl EarningsCheckpoint {
    /// Build a checkpoint from an authoritative balance snapshot.
    pub fn from_balance(balance: &OwnerBalance) -> Self {
        Self {
            owner_id: balance.owner_id,
            settled_earnings: balance.settled_earnings,
            rate_at_checkpoint: balance.daily_rate,
            checkpoint_time: balance.as_of,
        }
    }
}

/// How a ledger entry affects the running balance when folded.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Signed delta added to the running total.
    Increment,
    /// Replaces the running total.
    Absolute,
}

/// A balance-affecting action recorded while offline. Immutable once
/// written except for `synced`, which only moves false -> true.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub local_id: LocalId,
    pub owner_id: OwnerId,
    pub kind: EntryKind,
    /// Nanotons. Negative only for `Increment` (e.g. a claim).
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
    pub synced: bool,
}

/// Fold ledger entries onto a starting total in the given order.
///
/// `Absolute` entries replace the running total; `Increment` entries add
/// to it. The result never drops below zero.
pub fn fold_entries<'a>(start: u64, entries: impl IntoIterator<Item = &'a LedgerEntry>) -> u64 {
    let mut total = start as i128;
    for entry in entries {
        total = match entry.kind {
            EntryKind::Absolute => entry.amount.max(0) as i128,
            EntryKind::Increment => (total + entry.amount as i128).max(0),
        };
    }
    total.min(u64::MAX as i128) as u64
}

/// Audit row written once per settlement per position.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RewardHistoryRecord {
    pub position_id: PositionId,
    pub owner_id: OwnerId,
    pub amount: u64,
    /// Effective daily rate after duration bonus and rank multiplier.
    pub daily_rate_ppb: u64,
    pub base_rate_ppb: u64,
    pub rank_bonus_ppb: u64,
    pub duration_bonus_ppb: u64,
    pub days_covered: u64,
    pub created_at: DateTime<Utc>,
}

/// Rate engine output for one position-day.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RewardQuote {
    pub base_rate_ppb: u64,
    pub duration_bonus_ppb: u64,
    pub rank_bonus_ppb: u64,
    /// Effective daily rate: `(base + duration) * (1 + rank_bonus)`.
    pub daily_rate_ppb: u64,
    pub speed_boost_applied: bool,
    /// Reward before caps (boost already applied).
    pub uncapped_reward: u64,
    /// Final daily reward in nanotons.
    pub daily_reward: u64,
}

impl RewardQuote {
    /// Whether the absolute cap clamped this quote.
    pub fn was_capped(&self) -> bool {
        self.daily_reward < self.uncapped_reward
    }
}

/// Kind of user-visible event.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Deposit,
    Claim,
    Reward,
    Boost,
    CycleCompleted,
    Reinvestment,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivityStatus {
    Pending,
    Completed,
    Failed,
}

/// One entry of the user-visible activity feed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Deduplication key.
    pub id: String,
    pub owner_id: OwnerId,
    pub kind: ActivityKind,
    pub amount: u64,
    pub status: ActivityStatus,
    pub created_at: DateTime<Utc>,
}

/// Authoritative per-owner balance snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OwnerBalance {
    pub owner_id: OwnerId,
    /// Settled earnings as seen by the owner's wallet view.
    pub settled_earnings: u64,
    /// Aggregate daily reward of the owner's active positions.
    pub daily_rate: u64,
    /// Withdrawable balance (reinvestment credits land here).
    pub available_balance: u64,
    /// When `settled_earnings` was last written.
    pub as_of: DateTime<Utc>,
    /// Bumped on every write to `settled_earnings`.
    pub version: u64,
    /// Highest ledger entry the store has applied, per device.
    pub applied_entries: BTreeMap<DeviceId, LocalId>,
}

impl OwnerBalance {
    /// Highest entry of `device` the store has applied for this owner.
    pub fn last_applied_entry(&self, device: DeviceId) -> Option<LocalId> {
        self.applied_entries.get(&device).copied()
    }
}

/// A reconciliation write: the folded earnings of one device's entries.
///
/// Applied only if the owner's balance is still at `expected_version`, so
/// a settlement landing between the read and the write is never erased.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EarningsSubmission {
    pub device: DeviceId,
    pub value: u64,
    /// Latest ledger entry folded into `value`.
    pub as_of_entry: LocalId,
    pub expected_version: u64,
}

/// Position settlement applied atomically by the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub expected_version: u64,
    pub earnings_delta: u64,
    pub distributed_at: DateTime<Utc>,
    pub cycle_progress_ppb: u64,
    /// Flip the position to inactive (cycle completed).
    pub complete: bool,
    /// Appended in the same critical section as the position update.
    pub history: RewardHistoryRecord,
}

/// Atomic read-modify-write applied by [`AuthoritativeStore::update_position`](crate::traits::AuthoritativeStore::update_position).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum PositionMutation {
    Settle(Settlement),
    SetSpeedBoost { expected_version: u64, active: bool },
}

impl PositionMutation {
    pub fn expected_version(&self) -> u64 {
        match self {
            Self::Settle(s) => s.expected_version,
            Self::SetSpeedBoost { expected_version, .. } => *expected_version,
        }
    }
}

/// Key under which a mutating store call is applied at most once.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive a key as `domain:` followed by the BLAKE3 digest of the parts.
    ///
    /// Each part is length-prefixed so distinct part lists never collide.
    pub fn derive(domain: &str, parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        Self(format!("{domain}:{}", hex::encode(&digest.as_bytes()[..16])))
    }

    /// Key for a reconciliation submission of `device` ending at `latest`.
    pub fn reconcile(owner: OwnerId, device: DeviceId, latest: LocalId) -> Self {
        Self::derive(
            "reconcile",
            &[&owner.0.to_le_bytes(), &device.0.to_le_bytes(), &latest.0.to_le_bytes()],
        )
    }

    /// Key for settling the period of `position` that began at
    /// `period_start` (its previous `last_distribution_at`).
    pub fn settlement(position: PositionId, period_start: DateTime<Utc>) -> Self {
        Self::derive(
            "settle",
            &[&position.0.to_le_bytes(), &period_start.timestamp_millis().to_le_bytes()],
        )
    }

    /// Key for the one-time reinvestment credit of `position`.
    pub fn reinvestment(position: PositionId) -> Self {
        Self::derive("reinvest", &[&position.0.to_le_bytes()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
