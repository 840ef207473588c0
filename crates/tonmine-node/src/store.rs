//! In-process [`AuthoritativeStore`] backing the simulator and test suites.
//!
//! All state sits behind one `parking_lot::RwLock`, so every mutation
//! (including the history append of a settlement) is a single critical
//! section. Mutating calls are applied at most once per idempotency key.
//!
//! Fault injection makes the store behave like a flaky remote: calls can be
//! failed outright, or applied with the response "lost" (the caller sees a
//! transient error although the write happened).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use tonmine_core::error::{StoreError, ValidationError};
use tonmine_core::traits::{AuthoritativeStore, Clock};
use tonmine_core::types::{
    DeviceId, EarningsSubmission, IdempotencyKey, LocalId, OwnerBalance, OwnerId, Position,
    PositionId, PositionMutation, RewardHistoryRecord,
};
use tonmine_rate::RateEngine;

#[derive(Debug, Clone)]
struct OwnerAccount {
    settled_earnings: u64,
    available_balance: u64,
    as_of: DateTime<Utc>,
    /// Bumped whenever `settled_earnings` changes.
    version: u64,
    applied_entries: BTreeMap<DeviceId, LocalId>,
}

impl OwnerAccount {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            settled_earnings: 0,
            available_balance: 0,
            as_of: now,
            version: 0,
            applied_entries: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    next_position_id: u64,
    positions: BTreeMap<PositionId, Position>,
    accounts: HashMap<OwnerId, OwnerAccount>,
    applied_keys: HashSet<IdempotencyKey>,
    history: Vec<RewardHistoryRecord>,
}

impl StoreState {
    fn claim_key(&mut self, key: &IdempotencyKey) -> Result<(), StoreError> {
        if self.applied_keys.contains(key) {
            return Err(StoreError::Conflict { key: key.to_string() });
        }
        self.applied_keys.insert(key.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FaultPlan {
    online: bool,
    fail_calls: u32,
    lose_responses: u32,
}

/// Memory-resident authoritative store.
pub struct MemoryStore {
    engine: Arc<RateEngine>,
    clock: Arc<dyn Clock>,
    state: RwLock<StoreState>,
    faults: Mutex<FaultPlan>,
}

impl MemoryStore {
    pub fn new(engine: Arc<RateEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            state: RwLock::new(StoreState {
                next_position_id: 1,
                ..StoreState::default()
            }),
            faults: Mutex::new(FaultPlan { online: true, ..FaultPlan::default() }),
        }
    }

    /// Open a new position for `owner` (a deposit).
    pub fn open_position(
        &self,
        owner: OwnerId,
        principal: u64,
        rank: Option<String>,
    ) -> Result<Position, StoreError> {
        if principal == 0 {
            return Err(ValidationError::ZeroPrincipal.into());
        }
        let now = self.clock.now();
        let mut state = self.state.write();
        let id = PositionId(state.next_position_id);
        state.next_position_id += 1;

        let position = Position {
            id,
            owner_id: owner,
            principal,
            created_at: now,
            last_distribution_at: now,
            settled_earnings: 0,
            cycle_progress_ppb: 0,
            is_active: true,
            speed_boost_active: false,
            rank,
            version: 0,
        };
        state.accounts.entry(owner).or_insert_with(|| OwnerAccount::new(now));
        state.positions.insert(id, position.clone());
        info!(position = %id, %owner, principal, "position opened");
        Ok(position)
    }

    /// Insert a fully formed position (seeding and simulations).
    ///
    /// Later [`open_position`](Self::open_position) ids continue above it.
    pub fn insert_position(&self, position: Position) -> Result<(), StoreError> {
        if position.principal == 0 {
            return Err(ValidationError::ZeroPrincipal.into());
        }
        let now = self.clock.now();
        let mut state = self.state.write();
        state.next_position_id = state.next_position_id.max(position.id.0 + 1);
        state
            .accounts
            .entry(position.owner_id)
            .or_insert_with(|| OwnerAccount::new(now));
        debug!(position = %position.id, owner = %position.owner_id, "position inserted");
        state.positions.insert(position.id, position);
        Ok(())
    }

    /// Every history row written so far, in append order.
    pub fn history(&self) -> Vec<RewardHistoryRecord> {
        self.state.read().history.clone()
    }

    pub fn history_for(&self, position: PositionId) -> Vec<RewardHistoryRecord> {
        self.state
            .read()
            .history
            .iter()
            .filter(|h| h.position_id == position)
            .cloned()
            .collect()
    }

    /// Positions of one owner, active or not.
    pub fn positions_of(&self, owner: OwnerId) -> Vec<Position> {
        self.state
            .read()
            .positions
            .values()
            .filter(|p| p.owner_id == owner)
            .cloned()
            .collect()
    }

    // --- Fault injection ---

    /// While offline every call fails with [`StoreError::Transient`].
    pub fn set_online(&self, online: bool) {
        self.faults.lock().online = online;
    }

    /// Fail the next `count` calls before they touch any state.
    pub fn fail_next_calls(&self, count: u32) {
        self.faults.lock().fail_calls = count;
    }

    /// Apply the next `count` mutating calls but report a transient error.
    pub fn lose_next_responses(&self, count: u32) {
        self.faults.lock().lose_responses = count;
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if !faults.online {
            return Err(StoreError::Transient("store unreachable".into()));
        }
        if faults.fail_calls > 0 {
            faults.fail_calls -= 1;
            return Err(StoreError::Transient("injected failure".into()));
        }
        Ok(())
    }

    /// Called after a mutation was applied; may swallow the response.
    fn deliver<T>(&self, value: T) -> Result<T, StoreError> {
        let mut faults = self.faults.lock();
        if faults.lose_responses > 0 {
            faults.lose_responses -= 1;
            return Err(StoreError::Transient("response lost".into()));
        }
        Ok(value)
    }

    fn balance_of(&self, state: &StoreState, owner: OwnerId) -> Result<OwnerBalance, StoreError> {
        let account = state.accounts.get(&owner).ok_or(StoreError::OwnerNotFound(owner))?;
        let now = self.clock.now();
        let daily_rate = self
            .engine
            .aggregate_daily_reward(state.positions.values().filter(|p| p.owner_id == owner), now);
        Ok(OwnerBalance {
            owner_id: owner,
            settled_earnings: account.settled_earnings,
            daily_rate,
            available_balance: account.available_balance,
            as_of: account.as_of,
            version: account.version,
            applied_entries: account.applied_entries.clone(),
        })
    }
}

#[async_trait]
impl AuthoritativeStore for MemoryStore {
    async fn get_position(&self, id: PositionId) -> Result<Position, StoreError> {
        self.check_reachable()?;
        self.state
            .read()
            .positions
            .get(&id)
            .cloned()
            .ok_or(StoreError::PositionNotFound(id))
    }

    async fn active_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .state
            .read()
            .positions
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn update_position(
        &self,
        id: PositionId,
        mutation: PositionMutation,
        key: &IdempotencyKey,
    ) -> Result<Position, StoreError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.state.write();
        if state.applied_keys.contains(key) {
            return Err(StoreError::Conflict { key: key.to_string() });
        }

        let position = state.positions.get(&id).ok_or(StoreError::PositionNotFound(id))?;
        if position.version != mutation.expected_version() {
            return Err(StoreError::VersionMismatch {
                id,
                expected: mutation.expected_version(),
                found: position.version,
            });
        }
        if !position.is_active {
            return Err(StoreError::Inactive(id));
        }
        let owner = position.owner_id;

        let mut updated = position.clone();
        match mutation {
            PositionMutation::Settle(settlement) => {
                updated.settled_earnings = updated.settled_earnings.saturating_add(settlement.earnings_delta);
                updated.last_distribution_at = settlement.distributed_at;
                updated.cycle_progress_ppb = settlement.cycle_progress_ppb;
                if settlement.complete {
                    updated.is_active = false;
                }
                let account = state.accounts.entry(owner).or_insert_with(|| OwnerAccount::new(now));
                account.settled_earnings = account.settled_earnings.saturating_add(settlement.earnings_delta);
                account.as_of = now;
                account.version += 1;
                state.history.push(settlement.history);
            }
            PositionMutation::SetSpeedBoost { active, .. } => {
                updated.speed_boost_active = active;
            }
        }
        updated.version += 1;

        state.claim_key(key)?;
        state.positions.insert(id, updated.clone());
        drop(state);
        self.deliver(updated)
    }

    async fn get_owner_balance(&self, owner: OwnerId) -> Result<OwnerBalance, StoreError> {
        self.check_reachable()?;
        let state = self.state.read();
        self.balance_of(&state, owner)
    }

    async fn set_earnings(
        &self,
        owner: OwnerId,
        submission: EarningsSubmission,
        key: &IdempotencyKey,
    ) -> Result<OwnerBalance, StoreError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.state.write();
        if state.applied_keys.contains(key) {
            return Err(StoreError::Conflict { key: key.to_string() });
        }
        let account = state.accounts.get(&owner).ok_or(StoreError::OwnerNotFound(owner))?;
        if account.version != submission.expected_version {
            return Err(StoreError::StaleBalance {
                owner,
                expected: submission.expected_version,
                found: account.version,
            });
        }
        state.claim_key(key)?;

        if let Some(account) = state.accounts.get_mut(&owner) {
            account.settled_earnings = submission.value;
            account.as_of = now;
            account.version += 1;
            let applied = account.applied_entries.entry(submission.device).or_default();
            *applied = (*applied).max(submission.as_of_entry);
        }
        debug!(
            %owner,
            device = %submission.device,
            value = submission.value,
            entry = %submission.as_of_entry,
            "earnings set"
        );
        let balance = self.balance_of(&state, owner)?;
        drop(state);
        self.deliver(balance)
    }

    async fn credit_balance(
        &self,
        owner: OwnerId,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let mut state = self.state.write();
        if !state.accounts.contains_key(&owner) {
            return Err(StoreError::OwnerNotFound(owner));
        }
        state.claim_key(key)?;

        let mut available = 0;
        if let Some(account) = state.accounts.get_mut(&owner) {
            account.available_balance = account.available_balance.saturating_add(amount);
            available = account.available_balance;
        }
        info!(%owner, amount, available, "balance credited");
        drop(state);
        self.deliver(available)
    }
}
