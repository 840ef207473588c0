//! Replays offline ledger entries into the authoritative store.
//!
//! Reconciliation for one owner:
//! 1. read the unsynced entries and the authoritative balance
//! 2. entries at or below what the store has applied for this ledger's
//!    device were applied by a submission whose response was lost; they
//!    are marked synced as-is
//! 3. the rest are folded onto the authoritative value and submitted,
//!    keyed by `(owner, device, latest local id)` and conditioned on the
//!    balance version that was read
//! 4. a balance moved by a concurrent settlement is re-read and re-folded,
//!    a bounded number of times
//! 5. the folded entries are marked synced and the checkpoint is rebuilt
//!    from the store's echo, never from the local fold
//!
//! Calls for the same owner are serialized; different owners run in
//! parallel.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tonmine_core::error::{LedgerError, StoreError, SyncError};
use tonmine_core::traits::{AuthoritativeStore, Clock};
use tonmine_core::types::{
    fold_entries, ActivityKind, ActivityRecord, ActivityStatus, EarningsCheckpoint,
    EarningsSubmission, EntryKind, IdempotencyKey, LedgerEntry, LocalId, OwnerBalance, OwnerId,
};
use tonmine_ledger::DurableLedger;

use crate::activity::ActivityRecorder;

/// Submissions per reconcile call before a moving balance is reported.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// Outcome of recording an offline balance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineReceipt {
    pub local_id: LocalId,
    /// False if the entry is only held in memory.
    pub durable: bool,
}

pub struct ReconciliationService {
    store: Arc<dyn AuthoritativeStore>,
    ledger: Arc<DurableLedger>,
    clock: Arc<dyn Clock>,
    activity: Option<Arc<ActivityRecorder>>,
    locks: DashMap<OwnerId, Arc<tokio::sync::Mutex<()>>>,
    checkpoints: RwLock<HashMap<OwnerId, EarningsCheckpoint>>,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn AuthoritativeStore>,
        ledger: Arc<DurableLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            activity: None,
            locks: DashMap::new(),
            checkpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Report claims (negative increments) to `activity`. A claim is logged
    /// as pending when recorded; a completed or failed event follows once
    /// the store accepts it or rejects it permanently.
    pub fn with_activity(mut self, activity: Arc<ActivityRecorder>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Append an offline action to the ledger.
    ///
    /// A failed disk write still succeeds in memory and is reported through
    /// [`OfflineReceipt::durable`].
    pub fn record_offline(
        &self,
        owner: OwnerId,
        kind: EntryKind,
        amount: i64,
    ) -> Result<OfflineReceipt, LedgerError> {
        let now = self.clock.now();
        let receipt = match self.ledger.append(owner, kind, amount, now) {
            Ok(local_id) => OfflineReceipt { local_id, durable: true },
            Err(LedgerError::NotDurable { local_id, reason }) => {
                warn!(%owner, %local_id, %reason, "offline action not durable");
                OfflineReceipt { local_id, durable: false }
            }
            Err(e) => return Err(e),
        };
        if let Some(activity) = &self.activity
            && kind == EntryKind::Increment
            && amount < 0
        {
            activity.record(ActivityRecord {
                id: claim_activity_id(owner, receipt.local_id),
                owner_id: owner,
                kind: ActivityKind::Claim,
                amount: amount.unsigned_abs(),
                status: ActivityStatus::Pending,
                created_at: now,
            });
        }
        Ok(receipt)
    }

    /// Merge the owner's unsynced entries into the store and return the new
    /// checkpoint.
    pub async fn reconcile(&self, owner: OwnerId) -> Result<EarningsCheckpoint, SyncError> {
        let lock = self.owner_lock(owner);
        let result = {
            let _guard = lock.lock().await;
            self.reconcile_locked(owner).await
        };
        drop(lock);
        // Only the map's reference left: nobody holds or waits on the lock.
        self.locks.remove_if(&owner, |_, lock| Arc::strong_count(lock) == 1);

        if let Err(SyncError::Store(e)) = &result
            && !e.is_transient()
        {
            self.fail_pending_claims(owner);
        }
        result
    }

    async fn reconcile_locked(&self, owner: OwnerId) -> Result<EarningsCheckpoint, SyncError> {
        let device = self.ledger.device_id();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let entries = self.ledger.list_unsynced(owner)?;
            let balance = self.store.get_owner_balance(owner).await?;
            if entries.is_empty() {
                return Ok(self.install(&balance));
            }

            let last_applied = balance.last_applied_entry(device);
            let (applied, pending): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|e| last_applied.is_some_and(|last| e.local_id <= last));

            if !applied.is_empty() {
                self.mark_synced(&applied)?;
                info!(%owner, %device, count = applied.len(), "marked previously applied entries synced");
            }

            let Some(latest) = pending.iter().map(|e| e.local_id).max() else {
                return Ok(self.install(&balance));
            };

            let value = fold_entries(balance.settled_earnings, &pending);
            let key = IdempotencyKey::reconcile(owner, device, latest);
            let submission = EarningsSubmission {
                device,
                value,
                as_of_entry: latest,
                expected_version: balance.version,
            };
            let echoed = match self.store.set_earnings(owner, submission, &key).await {
                Ok(echoed) => echoed,
                Err(e) if e.is_conflict() => {
                    debug!(%owner, %key, "reconciliation already applied");
                    self.store.get_owner_balance(owner).await?
                }
                Err(StoreError::StaleBalance { expected, found, .. }) if attempt < MAX_SUBMIT_ATTEMPTS => {
                    debug!(%owner, attempt, expected, found, "balance moved during reconciliation, refolding");
                    continue;
                }
                Err(e) => {
                    warn!(%owner, entries = pending.len(), attempt, error = %e, "reconciliation submit failed");
                    return Err(e.into());
                }
            };

            self.mark_synced(&pending)?;
            info!(
                %owner,
                %device,
                entries = pending.len(),
                local_value = value,
                settled = echoed.settled_earnings,
                "reconciled offline entries"
            );
            return Ok(self.install(&echoed));
        }
    }

    /// The latest checkpoint for `owner`, if one was ever built.
    pub fn checkpoint(&self, owner: OwnerId) -> Option<EarningsCheckpoint> {
        self.checkpoints.read().get(&owner).cloned()
    }

    /// Whether `owner` has offline entries not yet accepted by the store.
    /// A ledger read failure reports pending.
    pub fn is_sync_pending(&self, owner: OwnerId) -> bool {
        self.ledger.has_unsynced(owner).unwrap_or_else(|e| {
            warn!(%owner, error = %e, "cannot read ledger");
            true
        })
    }

    /// Owners with unsynced ledger entries.
    pub fn pending_owners(&self) -> Result<Vec<OwnerId>, LedgerError> {
        self.ledger.owners_with_unsynced()
    }

    /// Drop synced entries from the ledger.
    pub fn collect_garbage(&self) -> Result<usize, LedgerError> {
        self.ledger.collect_garbage()
    }

    fn owner_lock(&self, owner: OwnerId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(owner).or_default().clone()
    }

    fn mark_synced(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let ids: Vec<LocalId> = entries.iter().map(|e| e.local_id).collect();
        self.ledger.mark_all_synced(&ids)?;
        self.set_claim_status(entries, ActivityStatus::Completed);
        Ok(())
    }

    fn fail_pending_claims(&self, owner: OwnerId) {
        if self.activity.is_none() {
            return;
        }
        match self.ledger.list_unsynced(owner) {
            Ok(entries) => self.set_claim_status(&entries, ActivityStatus::Failed),
            Err(e) => warn!(%owner, error = %e, "cannot read ledger"),
        }
    }

    fn set_claim_status(&self, entries: &[LedgerEntry], status: ActivityStatus) {
        let Some(activity) = &self.activity else { return };
        let now = self.clock.now();
        for entry in entries.iter().filter(|e| is_claim(e)) {
            let claim = claim_activity_id(entry.owner_id, entry.local_id);
            let suffix = match status {
                ActivityStatus::Pending => continue,
                ActivityStatus::Completed => "completed",
                ActivityStatus::Failed => "failed",
            };
            activity.record(ActivityRecord {
                id: format!("{claim}:{suffix}"),
                owner_id: entry.owner_id,
                kind: ActivityKind::Claim,
                amount: entry.amount.unsigned_abs(),
                status,
                created_at: now,
            });
        }
    }

    /// Replace the owner's checkpoint wholesale.
    fn install(&self, balance: &OwnerBalance) -> EarningsCheckpoint {
        let checkpoint = EarningsCheckpoint::from_balance(balance);
        self.checkpoints.write().insert(balance.owner_id, checkpoint.clone());
        checkpoint
    }
}

fn is_claim(entry: &LedgerEntry) -> bool {
    entry.kind == EntryKind::Increment && entry.amount < 0
}

fn claim_activity_id(owner: OwnerId, local_id: LocalId) -> String {
    format!("claim:{owner}:{local_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tonmine_core::constants::TON;
    use tonmine_core::time::ManualClock;
    use tonmine_rate::RateEngine;

    const OWNER: OwnerId = OwnerId(1);

    struct Fixture {
        service: Arc<ReconciliationService>,
        activity: Arc<ActivityRecorder>,
        store: Arc<MemoryStore>,
        ledger: Arc<DurableLedger>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new(Arc::new(RateEngine::default()), clock.clone()));
        store.open_position(OWNER, 100 * TON, None).unwrap();
        let ledger = Arc::new(DurableLedger::open(dir.path().join("ledger")).unwrap());
        let activity = Arc::new(ActivityRecorder::default());
        let service = Arc::new(
            ReconciliationService::new(store.clone(), ledger.clone(), clock.clone())
                .with_activity(activity.clone()),
        );
        Fixture { service, activity, store, ledger, clock, _dir: dir }
    }

    #[tokio::test]
    async fn empty_ledger_checkpoints_authoritative_balance() {
        let f = fixture();
        let cp = f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(cp.settled_earnings, 0);
        assert_eq!(cp.checkpoint_time, t0());
        assert!(cp.rate_at_checkpoint > 0);
        assert_eq!(f.service.checkpoint(OWNER), Some(cp));
    }

    #[tokio::test]
    async fn reconcile_twice_is_stable() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Increment, 5).unwrap();
        let first = f.service.reconcile(OWNER).await.unwrap();
        f.clock.advance(Duration::minutes(3));
        let second = f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn folds_entries_onto_authoritative_value() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Increment, 10).unwrap();
        f.service.record_offline(OWNER, EntryKind::Absolute, 100).unwrap();
        f.service.record_offline(OWNER, EntryKind::Increment, -30).unwrap();
        let cp = f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(cp.settled_earnings, 70);
        assert!(!f.service.is_sync_pending(OWNER));
    }

    #[tokio::test]
    async fn transient_failure_marks_nothing() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Increment, 10).unwrap();
        f.store.fail_next_calls(1);
        let err = f.service.reconcile(OWNER).await.unwrap_err();
        assert!(err.is_transient());
        assert!(f.service.is_sync_pending(OWNER));
        assert_eq!(f.service.reconcile(OWNER).await.unwrap().settled_earnings, 10);
    }

    #[tokio::test]
    async fn lost_response_is_not_applied_twice() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Increment, 10).unwrap();
        f.store.lose_next_responses(1);
        assert!(f.service.reconcile(OWNER).await.unwrap_err().is_transient());
        // The store applied the fold but the entry is still unsynced locally.
        assert!(f.service.is_sync_pending(OWNER));
        let cp = f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(cp.settled_earnings, 10);
        assert!(!f.service.is_sync_pending(OWNER));
    }

    #[tokio::test]
    async fn entries_after_lost_response_still_apply() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Increment, 10).unwrap();
        f.store.lose_next_responses(1);
        let _ = f.service.reconcile(OWNER).await;
        f.service.record_offline(OWNER, EntryKind::Increment, 5).unwrap();
        let cp = f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(cp.settled_earnings, 15);
    }

    #[tokio::test]
    async fn concurrent_reconciles_apply_once() {
        let f = fixture();
        for _ in 0..10 {
            f.service.record_offline(OWNER, EntryKind::Increment, 3).unwrap();
        }
        let a = tokio::spawn({
            let s = f.service.clone();
            async move { s.reconcile(OWNER).await }
        });
        let b = tokio::spawn({
            let s = f.service.clone();
            async move { s.reconcile(OWNER).await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.settled_earnings, 30);
        assert_eq!(b.settled_earnings, 30);
        assert!(f.service.locks.is_empty());
    }

    #[tokio::test]
    async fn owner_locks_are_released() {
        let f = fixture();
        for owner in [OWNER, OwnerId(2), OwnerId(3)] {
            let _ = f.service.reconcile(owner).await;
        }
        assert!(f.service.locks.is_empty());
    }

    #[tokio::test]
    async fn submission_is_scoped_to_this_device() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Increment, 6).unwrap();
        f.service.reconcile(OWNER).await.unwrap();
        let balance = f.store.get_owner_balance(OWNER).await.unwrap();
        assert_eq!(balance.last_applied_entry(f.ledger.device_id()), Some(LocalId(1)));
        assert_eq!(balance.applied_entries.len(), 1);
    }

    #[tokio::test]
    async fn claims_resolve_after_reconcile() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Absolute, 50).unwrap();
        let claim = f.service.record_offline(OWNER, EntryKind::Increment, -20).unwrap();
        let id = claim_activity_id(OWNER, claim.local_id);
        assert_eq!(f.activity.recent_for(OWNER, 10)[0].status, ActivityStatus::Pending);

        f.store.fail_next_calls(1);
        assert!(f.service.reconcile(OWNER).await.unwrap_err().is_transient());
        assert_eq!(f.activity.recent_for(OWNER, 10).len(), 1);

        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.service.reconcile(OWNER).await.unwrap().settled_earnings, 30);
        let feed = f.activity.recent_for(OWNER, 10);
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].id, format!("{id}:completed"));
        assert_eq!(feed[0].status, ActivityStatus::Completed);
        assert_eq!(feed[0].amount, 20);

        // Resolved once only.
        f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(f.activity.recent_for(OWNER, 10).len(), 2);
    }

    #[tokio::test]
    async fn claim_after_lost_response_completes() {
        let f = fixture();
        f.service.record_offline(OWNER, EntryKind::Absolute, 50).unwrap();
        f.service.record_offline(OWNER, EntryKind::Increment, -20).unwrap();
        f.store.lose_next_responses(1);
        let _ = f.service.reconcile(OWNER).await;
        f.clock.advance(Duration::seconds(1));
        f.service.reconcile(OWNER).await.unwrap();
        assert_eq!(f.activity.recent_for(OWNER, 10)[0].status, ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn rejected_claim_is_marked_failed() {
        let f = fixture();
        f.service.record_offline(OwnerId(77), EntryKind::Increment, -4).unwrap();
        assert!(!f.service.reconcile(OwnerId(77)).await.unwrap_err().is_transient());
        let feed = f.activity.recent_for(OwnerId(77), 10);
        assert_eq!(feed.len(), 2);
        assert!(feed.iter().any(|r| r.status == ActivityStatus::Failed && r.id.ends_with(":failed")));
        assert!(f.service.is_sync_pending(OwnerId(77)));
    }

    #[tokio::test]
    async fn non_durable_append_is_reported_and_still_synced() {
        let f = fixture();
        f.ledger.inject_write_failures(1);
        let receipt = f.service.record_offline(OWNER, EntryKind::Increment, 4).unwrap();
        assert!(!receipt.durable);
        assert_eq!(f.service.reconcile(OWNER).await.unwrap().settled_earnings, 4);
    }

    #[tokio::test]
    async fn unknown_owner_surfaces_store_error() {
        let f = fixture();
        f.service.record_offline(OwnerId(77), EntryKind::Increment, 4).unwrap();
        let err = f.service.reconcile(OwnerId(77)).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(f.service.pending_owners().unwrap(), vec![OwnerId(77)]);
    }
}
