//! Periodic settlement of overdue positions.
//!
//! A run scans the active positions, settles each one whose last
//! distribution is at least one interval old, and advances its cycle. Each
//! settlement is one optimistic `update_position` carrying its history row.
//! Positions are processed on a bounded pool; one position failing never
//! aborts the run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tonmine_core::config::SettlementConfig;
use tonmine_core::error::StoreError;
use tonmine_core::traits::{AuthoritativeStore, Clock, RewardCalculator};
use tonmine_core::types::{
    cycle_progress_ppb, ActivityKind, ActivityRecord, ActivityStatus, IdempotencyKey, Position,
    PositionMutation, RewardHistoryRecord, Settlement,
};

use crate::activity::ActivityRecorder;
use crate::cancel::Cancellation;

/// Execution knobs of the distributor; the reward rules live in
/// [`SettlementConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Positions settled concurrently.
    pub concurrency: usize,
    /// Re-reads after a lost optimistic version check.
    pub version_retries: u32,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self { concurrency: 8, version_retries: 3 }
    }
}

/// Summary of one [`BatchDistributor::run_once`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Positions a settlement was started for.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Positions not yet due, including those found settled by a concurrent
    /// writer.
    pub skipped: u64,
    pub total_distributed: u64,
    /// The run stopped early on cancellation.
    pub cancelled: bool,
}

/// Result of settling one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Settled { amount: u64, completed: bool },
    /// Another writer settled the period first.
    AlreadySettled,
}

pub struct BatchDistributor {
    store: Arc<dyn AuthoritativeStore>,
    calculator: Arc<dyn RewardCalculator>,
    activity: Arc<ActivityRecorder>,
    clock: Arc<dyn Clock>,
    settlement: SettlementConfig,
    config: DistributorConfig,
}

impl BatchDistributor {
    pub fn new(
        store: Arc<dyn AuthoritativeStore>,
        calculator: Arc<dyn RewardCalculator>,
        activity: Arc<ActivityRecorder>,
        clock: Arc<dyn Clock>,
        settlement: SettlementConfig,
        config: DistributorConfig,
    ) -> Self {
        Self { store, calculator, activity, clock, settlement, config }
    }

    /// Settle every overdue active position once.
    ///
    /// Only the initial scan can fail the run; per-position failures are
    /// logged and counted. Cancellation is checked before each position is
    /// started; settlements already in flight always complete.
    pub async fn run_once(self: &Arc<Self>, cancel: &Cancellation) -> Result<RunReport, StoreError> {
        let now = self.clock.now();
        let positions = self.store.active_positions().await?;
        let mut report = RunReport::default();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for position in positions {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !self.is_due(&position, now) {
                report.skipped += 1;
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            // Waiting for a permit may have taken a while.
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            report.processed += 1;
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let id = position.id;
                let owner = position.owner_id;
                (id, owner, this.settle_position(position, now).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, _, Ok(Outcome::Settled { amount, .. }))) => {
                    report.succeeded += 1;
                    report.total_distributed = report.total_distributed.saturating_add(amount);
                }
                Ok((_, _, Ok(Outcome::AlreadySettled))) => report.skipped += 1,
                Ok((position, owner, Err(e))) => {
                    report.failed += 1;
                    error!(%position, %owner, error = %e, "settlement failed");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "settlement task panicked");
                }
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            total_distributed = report.total_distributed,
            cancelled = report.cancelled,
            "distribution run finished"
        );
        Ok(report)
    }

    /// Whether a full distribution interval has elapsed.
    pub fn is_due(&self, position: &Position, now: DateTime<Utc>) -> bool {
        position.is_active && now - position.last_distribution_at >= self.settlement.distribution_interval()
    }

    /// Whole days owed, clamped to `[1, max_backlog_days]`.
    pub fn days_owed(&self, position: &Position, now: DateTime<Utc>) -> u64 {
        let hours = (now - position.last_distribution_at).num_hours().max(0) as u64;
        (hours / 24).clamp(1, self.settlement.max_backlog_days)
    }

    /// Settle one position, re-reading it after lost version checks.
    async fn settle_position(&self, mut position: Position, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        let mut attempt = 0;
        loop {
            match self.try_settle(&position, now).await {
                Err(StoreError::VersionMismatch { expected, found, .. }) if attempt < self.config.version_retries => {
                    attempt += 1;
                    debug!(position = %position.id, expected, found, attempt, "version changed, re-reading");
                    position = self.store.get_position(position.id).await?;
                    if !self.is_due(&position, now) {
                        return Ok(Outcome::AlreadySettled);
                    }
                }
                other => return other,
            }
        }
    }

    async fn try_settle(&self, position: &Position, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        let days = self.days_owed(position, now);
        let quote = self.calculator.compute_daily_reward(
            position.principal,
            position.days_staked(now),
            position.rank.as_deref(),
            position.speed_boost_active,
        );

        let ceiling = self.settlement.earnings_ceiling(position.principal);
        let room = ceiling.saturating_sub(position.settled_earnings);
        let owed = quote.daily_reward as u128 * days as u128;
        let total = owed.min(room as u128) as u64;
        if (total as u128) < owed {
            info!(position = %position.id, owed = owed as u64, total, "payout capped at cycle ceiling");
        }

        let settled = position.settled_earnings.saturating_add(total);
        let complete = settled >= ceiling;
        let completion_ppb = self.settlement.completion_ppb();
        let progress = if complete {
            completion_ppb
        } else {
            cycle_progress_ppb(settled, position.principal, completion_ppb)
        };

        let credit = self.settlement.reinvestment_credit(position.principal);
        if complete && credit > 0 {
            // Issued first; the key makes a repeat after a crash a no-op.
            let key = IdempotencyKey::reinvestment(position.id);
            match self.store.credit_balance(position.owner_id, credit, &key).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => debug!(position = %position.id, "reinvestment already credited"),
                Err(e) => return Err(e),
            }
        }

        let mutation = PositionMutation::Settle(Settlement {
            expected_version: position.version,
            earnings_delta: total,
            distributed_at: now,
            cycle_progress_ppb: progress,
            complete,
            history: RewardHistoryRecord {
                position_id: position.id,
                owner_id: position.owner_id,
                amount: total,
                daily_rate_ppb: quote.daily_rate_ppb,
                base_rate_ppb: quote.base_rate_ppb,
                rank_bonus_ppb: quote.rank_bonus_ppb,
                duration_bonus_ppb: quote.duration_bonus_ppb,
                days_covered: days,
                created_at: now,
            },
        });
        let key = IdempotencyKey::settlement(position.id, position.last_distribution_at);
        match self.store.update_position(position.id, mutation, &key).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                warn!(position = %position.id, "period already settled");
                return Ok(Outcome::AlreadySettled);
            }
            Err(e) => return Err(e),
        }

        debug!(position = %position.id, owner = %position.owner_id, days, total, "position settled");
        self.record_activity(position, total, now, complete.then_some(credit));
        Ok(Outcome::Settled { amount: total, completed: complete })
    }

    fn record_activity(&self, position: &Position, total: u64, now: DateTime<Utc>, credit: Option<u64>) {
        let event = |id: String, kind, amount| ActivityRecord {
            id,
            owner_id: position.owner_id,
            kind,
            amount,
            status: ActivityStatus::Completed,
            created_at: now,
        };

        if total > 0 {
            self.activity.record(event(
                format!("reward:{}:{}", position.id, now.timestamp_millis()),
                ActivityKind::Reward,
                total,
            ));
        }
        if let Some(credit) = credit {
            info!(position = %position.id, owner = %position.owner_id, credit, "cycle completed");
            self.activity.record(event(format!("cycle:{}", position.id), ActivityKind::CycleCompleted, 0));
            if credit > 0 {
                self.activity.record(event(
                    format!("reinvest:{}", position.id),
                    ActivityKind::Reinvestment,
                    credit,
                ));
            }
        }
    }
}
