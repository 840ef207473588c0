//! Shared test helpers for E2E and adversarial tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use tonmine_core::config::RateConfig;
use tonmine_core::time::ManualClock;
use tonmine_core::types::{OwnerId, Position, PositionId};
use tonmine_node_lib::{Node, NodeConfig};

/// Fixed start of every simulated timeline.
pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Default rules with the duration bonus switched off, so a principal earns
/// exactly its tier rate.
pub fn flat_rate() -> RateConfig {
    RateConfig {
        duration_bonus_per_day_ppb: 0,
        duration_bonus_cap_ppb: 0,
        ..RateConfig::default()
    }
}

/// A node on a manual clock, backed by a temp directory.
pub struct Harness {
    pub node: Arc<Node>,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
}

impl Harness {
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// Harness with flat rates and otherwise default configuration.
pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Harness whose configuration is adjusted by `tweak` before startup.
pub fn harness_with(tweak: impl FnOnce(&mut NodeConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig {
        data_dir: dir.path().join("data"),
        rate: flat_rate(),
        ..NodeConfig::default()
    };
    tweak(&mut config);
    let clock = Arc::new(ManualClock::new(t0()));
    let node = Node::with_clock(config, clock.clone()).unwrap();
    Harness { node, clock, dir }
}

/// An active, never-distributed position created at `start`.
pub fn position(id: u64, owner: u64, principal: u64, start: DateTime<Utc>) -> Position {
    Position {
        id: PositionId(id),
        owner_id: OwnerId(owner),
        principal,
        created_at: start,
        last_distribution_at: start,
        settled_earnings: 0,
        cycle_progress_ppb: 0,
        is_active: true,
        speed_boost_active: false,
        rank: None,
        version: 0,
    }
}
