//! Background drain of the offline ledger when connectivity returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use tonmine_core::error::SyncError;

use crate::cancel::Cancellation;
use crate::reconcile::ReconciliationService;
use crate::retry::RetryPolicy;

/// Counts from one pass over the pending owners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub failed: usize,
    /// Synced ledger entries garbage-collected afterwards.
    pub collected: usize,
}

/// Reconciles every owner with pending entries whenever the connectivity
/// signal reads `true`, and re-polls every `poll_interval` while online.
pub struct SyncWorker {
    reconciler: Arc<ReconciliationService>,
    retry: RetryPolicy,
    connectivity: watch::Receiver<bool>,
    poll_interval: Duration,
}

impl SyncWorker {
    pub fn new(
        reconciler: Arc<ReconciliationService>,
        retry: RetryPolicy,
        connectivity: watch::Receiver<bool>,
        poll_interval: Duration,
    ) -> Self {
        Self { reconciler, retry, connectivity, poll_interval }
    }

    /// Reconcile every pending owner once, retrying transient failures.
    pub async fn drain_once(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let owners = match self.reconciler.pending_owners() {
            Ok(owners) => owners,
            Err(e) => {
                error!(error = %e, "cannot list pending owners");
                return report;
            }
        };
        if owners.is_empty() {
            return report;
        }

        debug!(owners = owners.len(), "draining offline ledger");
        let reconciler = &self.reconciler;
        for owner in owners {
            let result = self
                .retry
                .run("reconcile", move || reconciler.reconcile(owner), SyncError::is_transient)
                .await;
            match result {
                Ok(checkpoint) => {
                    report.synced += 1;
                    debug!(%owner, settled = checkpoint.settled_earnings, "owner synced");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(%owner, error = %e, "owner sync failed");
                }
            }
        }

        match self.reconciler.collect_garbage() {
            Ok(collected) => report.collected = collected,
            Err(e) => error!(error = %e, "ledger garbage collection failed"),
        }
        info!(synced = report.synced, failed = report.failed, collected = report.collected, "ledger drain finished");
        report
    }

    /// Run until cancelled or the connectivity sender is dropped.
    pub async fn run(mut self, cancel: Cancellation) {
        info!("sync worker started");
        loop {
            let online = async { self.connectivity.wait_for(|online| *online).await.map(|_| ()) };
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = online => if result.is_err() { break },
            }

            self.drain_once().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.connectivity.changed() => if changed.is_err() { break },
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("sync worker stopped");
    }
}
