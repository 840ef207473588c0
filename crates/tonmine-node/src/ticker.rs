//! Timer-driven publication of the display balance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use tonmine_core::types::{EarningsCheckpoint, OwnerId};
use tonmine_rate::AccrualClock;

use crate::cancel::Cancellation;
use crate::reconcile::ReconciliationService;

const MIN_PERIOD: Duration = Duration::from_millis(100);
const MAX_PERIOD: Duration = Duration::from_secs(1);

/// Publishes one owner's estimated balance on a watch channel.
///
/// For a given checkpoint the published values never decrease; a new
/// checkpoint may move the value in either direction.
pub struct DisplayTicker {
    accrual: AccrualClock,
    reconciler: Arc<ReconciliationService>,
    owner: OwnerId,
    period: Duration,
    tx: watch::Sender<u64>,
    last: Option<(EarningsCheckpoint, u64)>,
}

impl DisplayTicker {
    /// `period` is clamped to 100ms..=1s.
    pub fn new(
        accrual: AccrualClock,
        reconciler: Arc<ReconciliationService>,
        owner: OwnerId,
        period: Duration,
    ) -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        let ticker = Self {
            accrual,
            reconciler,
            owner,
            period: period.clamp(MIN_PERIOD, MAX_PERIOD),
            tx,
            last: None,
        };
        (ticker, rx)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Compute and publish the current estimate.
    pub fn tick(&mut self) -> u64 {
        let checkpoint = self.reconciler.checkpoint(self.owner);
        let estimate = self.accrual.estimate_now(checkpoint.as_ref());
        let value = match (&self.last, &checkpoint) {
            (Some((prev_cp, prev)), Some(cp)) if prev_cp == cp => estimate.max(*prev),
            _ => estimate,
        };
        self.last = checkpoint.map(|cp| (cp, value));
        self.tx.send_replace(value);
        value
    }

    pub async fn run(mut self, cancel: Cancellation) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => { self.tick(); }
            }
        }
        debug!(owner = %self.owner, "display ticker stopped");
    }
}
