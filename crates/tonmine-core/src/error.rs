//! Error types for the tonmine accrual engine.
use thiserror::Error;

use crate::types::{LocalId, OwnerId, PositionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no base tiers configured")] NoTiers,
    #[error("duplicate base tier threshold: {0}")] DuplicateTier(u64),
    #[error("tier rate {rate_ppb} ppb exceeds 100%")] TierRateTooHigh { rate_ppb: u64 },
    #[error("duration bonus cap {cap} below per-day bonus {per_day}")] DurationCap { per_day: u64, cap: u64 },
    #[error("speed boost multiplier must be at least 1.0x, got {0} bps")] BoostMultiplier(u64),
    #[error("absolute cap must be non-zero")] ZeroCap,
    #[error("absolute cap {0} ppb exceeds 100%")] CapTooHigh(u64),
    #[error("max backlog days must be non-zero")] ZeroBacklog,
    #[error("distribution interval must be non-zero")] ZeroInterval,
    #[error("cycle completion must be in 1..=300%, got {0}%")] CompletionPct(u64),
    #[error("reinvest ratio {0} bps exceeds 100%")] ReinvestRatio(u64),
    #[error("principal must be positive")] ZeroPrincipal,
    #[error("absolute ledger amount must be non-negative: {0}")] NegativeAbsolute(i64),
    #[error("config: {0}")] Config(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")] Transient(String),
    #[error("idempotency key already applied: {key}")] Conflict { key: String },
    #[error("version mismatch on position {id}: expected {expected}, found {found}")] VersionMismatch { id: PositionId, expected: u64, found: u64 },
    #[error("position not found: {0}")] PositionNotFound(PositionId),
    #[error("owner not found: {0}")] OwnerNotFound(OwnerId),
    #[error("position {0} is no longer active")] Inactive(PositionId),
    #[error("balance of owner {owner} moved: expected version {expected}, found {found}")] StaleBalance { owner: OwnerId, expected: u64, found: u64 },
    #[error(transparent)] Validation(#[from] ValidationError),
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::StaleBalance { .. })
    }

    /// Whether the call was a repeat of an already-applied idempotency key.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger storage: {0}")] Storage(String),
    #[error("ledger codec: {0}")] Codec(String),
    #[error("entry {local_id} kept in memory only: {reason}")] NotDurable { local_id: LocalId, reason: String },
    #[error("unknown ledger entry: {0}")] UnknownEntry(LocalId),
    #[error(transparent)] Validation(#[from] ValidationError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Ledger(#[from] LedgerError),
}

impl SyncError {
    /// Transient store failures are retried by the scheduler; everything
    /// else is surfaced to operators.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Ledger(LedgerError::Storage(_)) => true,
            Self::Ledger(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum TonmineError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Ledger(#[from] LedgerError),
    #[error(transparent)] Sync(#[from] SyncError),
}
