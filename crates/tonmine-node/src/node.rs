//! Node composition.
//!
//! The [`Node`] struct wires the rate engine, the in-process authoritative
//! store, the durable ledger, reconciliation, the batch distributor and the
//! activity log into one running engine. Background loops (sync worker,
//! display ticker) are built from it and driven by the caller.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use tonmine_core::error::{LedgerError, StoreError, SyncError, TonmineError};
use tonmine_core::time::SystemClock;
use tonmine_core::traits::{AuthoritativeStore, Clock};
use tonmine_core::types::{
    ActivityKind, ActivityRecord, ActivityStatus, EarningsCheckpoint, EntryKind, IdempotencyKey,
    OwnerId, Position, PositionId, PositionMutation,
};
use tonmine_ledger::DurableLedger;
use tonmine_rate::{AccrualClock, RateEngine};

use crate::activity::ActivityRecorder;
use crate::cancel::Cancellation;
use crate::config::NodeConfig;
use crate::distributor::{BatchDistributor, RunReport};
use crate::reconcile::{OfflineReceipt, ReconciliationService};
use crate::store::MemoryStore;
use crate::sync::SyncWorker;
use crate::ticker::DisplayTicker;

/// The accrual engine, composing store, ledger, reconciliation and
/// distribution.
pub struct Node {
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    engine: Arc<RateEngine>,
    store: Arc<MemoryStore>,
    reconciler: Arc<ReconciliationService>,
    distributor: Arc<BatchDistributor>,
    activity: Arc<ActivityRecorder>,
    accrual: AccrualClock,
}

impl Node {
    /// Create a node on the wall clock.
    pub fn open(config: NodeConfig) -> Result<Arc<Self>, TonmineError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a node with an injected clock.
    ///
    /// Validates the configuration and opens (or creates) the ledger under
    /// `data_dir`.
    pub fn with_clock(config: NodeConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>, TonmineError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| LedgerError::Storage(format!("create {}: {e}", config.data_dir.display())))?;

        let engine = Arc::new(RateEngine::new(config.rate.clone())?);
        let store = Arc::new(MemoryStore::new(Arc::clone(&engine), Arc::clone(&clock)));
        let ledger = Arc::new(DurableLedger::open(config.ledger_path())?);
        let activity = Arc::new(ActivityRecorder::new(config.activity_retention));

        let reconciler = Arc::new(
            ReconciliationService::new(store.clone(), ledger, Arc::clone(&clock))
                .with_activity(Arc::clone(&activity)),
        );
        let distributor = Arc::new(BatchDistributor::new(
            store.clone(),
            engine.clone(),
            Arc::clone(&activity),
            Arc::clone(&clock),
            config.settlement.clone(),
            config.distributor.clone(),
        ));
        let accrual = AccrualClock::new(Arc::clone(&clock));

        info!(data_dir = %config.data_dir.display(), "node initialized");
        Ok(Arc::new(Self {
            config,
            clock,
            engine,
            store,
            reconciler,
            distributor,
            activity,
            accrual,
        }))
    }

    // --- Balance actions ---

    /// Open a new position for `owner`.
    pub fn deposit(
        &self,
        owner: OwnerId,
        principal: u64,
        rank: Option<String>,
    ) -> Result<Position, StoreError> {
        let position = self.store.open_position(owner, principal, rank)?;
        self.activity.record(ActivityRecord {
            id: format!("deposit:{}", position.id),
            owner_id: owner,
            kind: ActivityKind::Deposit,
            amount: principal,
            status: ActivityStatus::Completed,
            created_at: position.created_at,
        });
        Ok(position)
    }

    /// Turn the speed boost of a position on or off.
    pub async fn set_speed_boost(&self, id: PositionId, active: bool) -> Result<Position, StoreError> {
        let position = self.store.get_position(id).await?;
        let key = IdempotencyKey::derive(
            "boost",
            &[&id.0.to_le_bytes(), &position.version.to_le_bytes()],
        );
        let mutation = PositionMutation::SetSpeedBoost { expected_version: position.version, active };
        let updated = self.store.update_position(id, mutation, &key).await?;
        if active {
            self.activity.record(ActivityRecord {
                id: format!("boost:{}:{}", id, updated.version),
                owner_id: updated.owner_id,
                kind: ActivityKind::Boost,
                amount: 0,
                status: ActivityStatus::Completed,
                created_at: self.clock.now(),
            });
        }
        debug!(position = %id, active, "speed boost updated");
        Ok(updated)
    }

    /// Record an offline balance action for later reconciliation.
    ///
    /// Negative increments are claims and show up in the activity feed as
    /// pending until reconciliation resolves them.
    pub fn record_offline(
        &self,
        owner: OwnerId,
        kind: EntryKind,
        amount: i64,
    ) -> Result<OfflineReceipt, LedgerError> {
        self.reconciler.record_offline(owner, kind, amount)
    }

    /// Seed positions (simulations and fixtures). Returns how many were
    /// inserted.
    pub fn seed_positions(&self, positions: Vec<Position>) -> Result<usize, StoreError> {
        let count = positions.len();
        for position in positions {
            self.store.insert_position(position)?;
        }
        info!(count, "positions seeded");
        Ok(count)
    }

    // --- Upward operations ---

    /// Display estimate of the owner's earnings right now.
    pub fn estimate(&self, owner: OwnerId) -> u64 {
        self.accrual.estimate_now(self.reconciler.checkpoint(owner).as_ref())
    }

    pub async fn reconcile(&self, owner: OwnerId) -> Result<EarningsCheckpoint, SyncError> {
        self.reconciler.reconcile(owner).await
    }

    pub async fn run_distribution(&self, cancel: &Cancellation) -> Result<RunReport, StoreError> {
        self.distributor.run_once(cancel).await
    }

    pub fn recent_activity(&self, owner: OwnerId, limit: usize) -> Vec<ActivityRecord> {
        self.activity.recent_for(owner, limit)
    }

    pub fn is_sync_pending(&self, owner: OwnerId) -> bool {
        self.reconciler.is_sync_pending(owner)
    }

    // --- Background loops ---

    /// Build the worker draining the ledger on `connectivity`.
    pub fn sync_worker(&self, connectivity: watch::Receiver<bool>) -> SyncWorker {
        SyncWorker::new(
            Arc::clone(&self.reconciler),
            self.config.retry.clone(),
            connectivity,
            self.config.sync_poll_interval(),
        )
    }

    /// Build a display ticker for one owner.
    pub fn display_ticker(&self, owner: OwnerId) -> (DisplayTicker, watch::Receiver<u64>) {
        DisplayTicker::new(
            self.accrual.clone(),
            Arc::clone(&self.reconciler),
            owner,
            self.config.ticker_period(),
        )
    }

    // --- Accessors ---

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn engine(&self) -> &RateEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}
