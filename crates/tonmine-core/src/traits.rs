//! Trait interfaces between the tonmine crates:
//! - [`Clock`]: injectable time source (tests use [`ManualClock`](crate::time::ManualClock))
//! - [`RewardCalculator`]: daily reward math (tonmine-rate implements)
//! - [`AuthoritativeStore`]: the server-side ledger of positions and balances

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    EarningsSubmission, IdempotencyKey, OwnerBalance, OwnerId, Position, PositionId, PositionMutation,
    RewardQuote,
};

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Pure computation of daily yield for a position.
///
/// Implementations must be deterministic: no clock reads, no randomness.
pub trait RewardCalculator: Send + Sync {
    /// Effective daily rate and capped daily reward for one position-day.
    fn compute_daily_reward(
        &self,
        principal: u64,
        days_staked: u64,
        rank: Option<&str>,
        speed_boost_active: bool,
    ) -> RewardQuote;

    /// Upper bound on any single day's reward for `principal`.
    fn absolute_cap(&self, principal: u64) -> u64;
}

/// The authoritative store of positions, balances and reward history.
///
/// Every mutating call takes an [`IdempotencyKey`]. Repeating a key that was
/// already applied returns [`StoreError::Conflict`] without applying it
/// again; callers treat that as success.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    async fn get_position(&self, id: PositionId) -> Result<Position, StoreError>;

    /// All positions with `is_active == true`.
    async fn active_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Apply `mutation` if the position's version still matches.
    ///
    /// A [`PositionMutation::Settle`] also appends its history record in the
    /// same critical section. Returns the updated position.
    async fn update_position(
        &self,
        id: PositionId,
        mutation: PositionMutation,
        key: &IdempotencyKey,
    ) -> Result<Position, StoreError>;

    async fn get_owner_balance(&self, owner: OwnerId) -> Result<OwnerBalance, StoreError>;

    /// Set the owner's settled earnings to `submission.value` and record
    /// `submission.as_of_entry` as applied for its device.
    ///
    /// Fails with [`StoreError::StaleBalance`] if the balance moved past
    /// `submission.expected_version`. Returns the store's view after
    /// applying.
    async fn set_earnings(
        &self,
        owner: OwnerId,
        submission: EarningsSubmission,
        key: &IdempotencyKey,
    ) -> Result<OwnerBalance, StoreError>;

    /// Add `amount` to the owner's available balance. Returns the new balance.
    async fn credit_balance(
        &self,
        owner: OwnerId,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualClock, SystemClock};
    use crate::types::RewardQuote;
    use std::sync::Arc;

    struct FlatCalculator;

    impl RewardCalculator for FlatCalculator {
        fn compute_daily_reward(&self, principal: u64, _: u64, _: Option<&str>, _: bool) -> RewardQuote {
            RewardQuote {
                base_rate_ppb: 10_000_000,
                duration_bonus_ppb: 0,
                rank_bonus_ppb: 0,
                daily_rate_ppb: 10_000_000,
                speed_boost_applied: false,
                uncapped_reward: principal / 100,
                daily_reward: principal / 100,
            }
        }

        fn absolute_cap(&self, principal: u64) -> u64 {
            principal
        }
    }

    #[test]
    fn calculator_is_object_safe() {
        let calc: Arc<dyn RewardCalculator> = Arc::new(FlatCalculator);
        assert_eq!(calc.compute_daily_reward(1_000, 0, None, false).daily_reward, 10);
        assert_eq!(calc.absolute_cap(5), 5);
    }

    #[test]
    fn clocks_are_object_safe() {
        let clocks: Vec<Arc<dyn Clock>> = vec![
            Arc::new(SystemClock),
            Arc::new(ManualClock::new(Utc::now())),
        ];
        for clock in clocks {
            assert!(clock.now().timestamp() > 0);
        }
    }

    #[test]
    fn store_is_object_safe() {
        fn takes_store(_: Option<Arc<dyn AuthoritativeStore>>) {}
        takes_store(None);
    }
}
