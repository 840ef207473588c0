//! Append-only, deduplicated feed of user-visible events.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use tracing::debug;

use tonmine_core::constants::DEFAULT_ACTIVITY_RETENTION;
use tonmine_core::types::{ActivityRecord, OwnerId};

#[derive(Default)]
struct ActivityLog {
    /// Every id ever recorded, so a dropped record is never re-added.
    seen: HashSet<String>,
    /// Per-owner records ordered by `created_at`, oldest first.
    by_owner: HashMap<OwnerId, VecDeque<ActivityRecord>>,
}

/// In-memory activity log keeping the newest `retention_per_owner` records
/// of each owner.
pub struct ActivityRecorder {
    retention_per_owner: usize,
    log: RwLock<ActivityLog>,
}

impl ActivityRecorder {
    pub fn new(retention_per_owner: usize) -> Self {
        Self {
            retention_per_owner: retention_per_owner.max(1),
            log: RwLock::new(ActivityLog::default()),
        }
    }

    /// Record an event. Returns `false` (and changes nothing) if an event
    /// with the same id was already recorded.
    pub fn record(&self, record: ActivityRecord) -> bool {
        let mut log = self.log.write();
        if !log.seen.insert(record.id.clone()) {
            debug!(id = %record.id, "duplicate activity ignored");
            return false;
        }

        let records = log.by_owner.entry(record.owner_id).or_default();
        let at = records.partition_point(|r| r.created_at <= record.created_at);
        records.insert(at, record);
        while records.len() > self.retention_per_owner {
            records.pop_front();
        }
        true
    }

    /// Most recent events of `owner`, newest first, at most `limit`.
    pub fn recent_for(&self, owner: OwnerId, limit: usize) -> Vec<ActivityRecord> {
        let log = self.log.read();
        log.by_owner
            .get(&owner)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an event id has ever been recorded.
    pub fn contains(&self, id: &str) -> bool {
        self.log.read().seen.contains(id)
    }
}

impl Default for ActivityRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_RETENTION)
    }
}
