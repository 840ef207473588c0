//! RocksDB-backed durable ledger of unsynced balance deltas.
//!
//! Column families:
//! - `entries`: `owner(8) || occurred_at(8) || local_id(8)` -> bincode entry,
//!   so a prefix scan over the owner yields entries in replay order
//! - `index`: `local_id(8)` -> entry key, for `mark_synced`
//! - `meta`: the persisted `local_id` counter and the device id
//!
//! All mutations use atomic [`WriteBatch`]. Entries whose write fails are
//! kept in memory and retried on the next append, so an offline action is
//! never lost while the process lives.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, SliceTransform, WriteBatch, DB};
use tracing::{debug, info, warn};

use tonmine_core::error::{LedgerError, ValidationError};
use tonmine_core::types::{DeviceId, EntryKind, LedgerEntry, LocalId, OwnerId};

// --- Column family names ---

const CF_ENTRIES: &str = "entries";
const CF_INDEX: &str = "index";
const CF_META: &str = "meta";

const ALL_CFS: &[&str] = &[CF_ENTRIES, CF_INDEX, CF_META];

const META_NEXT_LOCAL_ID: &[u8] = b"next_local_id";
const META_DEVICE_ID: &[u8] = b"device_id";

const ENTRY_KEY_LEN: usize = 24;

/// On-disk form of a [`LedgerEntry`].
#[derive(bincode::Encode, bincode::Decode)]
struct StoredEntry {
    local_id: u64,
    owner_id: u64,
    /// 0 = increment, 1 = absolute.
    kind: u8,
    amount: i64,
    occurred_at_ms: i64,
    synced: bool,
}

impl From<&LedgerEntry> for StoredEntry {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            local_id: entry.local_id.0,
            owner_id: entry.owner_id.0,
            kind: match entry.kind {
                EntryKind::Increment => 0,
                EntryKind::Absolute => 1,
            },
            amount: entry.amount,
            occurred_at_ms: entry.occurred_at.timestamp_millis(),
            synced: entry.synced,
        }
    }
}

impl TryFrom<StoredEntry> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(stored: StoredEntry) -> Result<Self, LedgerError> {
        let kind = match stored.kind {
            0 => EntryKind::Increment,
            1 => EntryKind::Absolute,
            other => return Err(LedgerError::Codec(format!("unknown entry kind {other}"))),
        };
        let occurred_at = Utc
            .timestamp_millis_opt(stored.occurred_at_ms)
            .single()
            .ok_or_else(|| LedgerError::Codec(format!("bad timestamp {}", stored.occurred_at_ms)))?;
        Ok(LedgerEntry {
            local_id: LocalId(stored.local_id),
            owner_id: OwnerId(stored.owner_id),
            kind,
            amount: stored.amount,
            occurred_at,
            synced: stored.synced,
        })
    }
}

/// Mutable state guarded by the append lock.
struct LedgerState {
    next_local_id: u64,
    /// Entries that could not be written to disk, by local id.
    volatile: BTreeMap<u64, LedgerEntry>,
    /// Remaining injected write failures.
    #[cfg(any(test, feature = "testing"))]
    failing_writes: u32,
}

/// Append-only replay log of balance actions taken while offline.
///
/// The ledger is never read as a balance; it only records what must be
/// replayed into the authoritative store.
pub struct DurableLedger {
    db: DB,
    /// Generated once per database; local ids are only unique within it.
    device: DeviceId,
    state: Mutex<LedgerState>,
}

impl DurableLedger {
    /// Open or create a ledger database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Owner id is the fixed 8-byte key prefix of every entry.
                if *name == CF_ENTRIES {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(8));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let mut ledger = Self {
            db,
            device: DeviceId::default(),
            state: Mutex::new(LedgerState {
                next_local_id: 1,
                volatile: BTreeMap::new(),
                #[cfg(any(test, feature = "testing"))]
                failing_writes: 0,
            }),
        };
        ledger.device = match ledger.get_meta_u64(META_DEVICE_ID)? {
            Some(id) => DeviceId(id),
            None => ledger.create_device_id()?,
        };
        let next = ledger.get_meta_u64(META_NEXT_LOCAL_ID)?.unwrap_or(1);
        ledger.state.lock().next_local_id = next;
        debug!(device = %ledger.device, next_local_id = next, "opened durable ledger");

        Ok(ledger)
    }

    /// The device this ledger's entries belong to.
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Record a balance action. The entry is assigned the next local id.
    ///
    /// If the disk write fails the entry is still kept in memory (and listed
    /// by [`list_unsynced`](Self::list_unsynced)); the failure is returned as
    /// [`LedgerError::NotDurable`] carrying the assigned id.
    pub fn append(
        &self,
        owner: OwnerId,
        kind: EntryKind,
        amount: i64,
        occurred_at: DateTime<Utc>,
    ) -> Result<LocalId, LedgerError> {
        if kind == EntryKind::Absolute && amount < 0 {
            return Err(ValidationError::NegativeAbsolute(amount).into());
        }

        let mut state = self.state.lock();
        self.persist_volatile(&mut state);

        let local_id = LocalId(state.next_local_id);
        state.next_local_id += 1;

        let entry = LedgerEntry {
            local_id,
            owner_id: owner,
            kind,
            amount,
            occurred_at,
            synced: false,
        };

        let result = self
            .stage_entry(&entry, state.next_local_id)
            .and_then(|batch| self.write(&mut state, batch));
        match result {
            Ok(()) => {
                debug!(%owner, %local_id, ?kind, amount, "ledger entry appended");
                Ok(local_id)
            }
            Err(e) => {
                warn!(%owner, %local_id, error = %e, "ledger write failed; entry kept in memory");
                state.volatile.insert(local_id.0, entry);
                Err(LedgerError::NotDurable { local_id, reason: e.to_string() })
            }
        }
    }

    /// Unsynced entries of `owner`, ordered by `occurred_at` then `local_id`.
    pub fn list_unsynced(&self, owner: OwnerId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries: Vec<LedgerEntry> = self
            .scan_owner(owner)?
            .into_iter()
            .filter(|e| !e.synced)
            .collect();

        let state = self.state.lock();
        entries.extend(
            state
                .volatile
                .values()
                .filter(|e| e.owner_id == owner && !e.synced)
                .cloned(),
        );
        entries.sort_by_key(|e| (e.occurred_at, e.local_id));
        Ok(entries)
    }

    /// Flag one entry as synced. Idempotent.
    pub fn mark_synced(&self, local_id: LocalId) -> Result<(), LedgerError> {
        self.mark_all_synced(&[local_id])
    }

    /// Flag every listed entry as synced in a single atomic batch; either all
    /// flags are written or none are.
    pub fn mark_all_synced(&self, ids: &[LocalId]) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        let mut volatile_hits = Vec::new();

        for id in ids {
            if state.volatile.contains_key(&id.0) {
                volatile_hits.push(id.0);
                continue;
            }
            let key = self.entry_key_for(*id)?;
            let mut entry = self.read_entry(&key)?.ok_or(LedgerError::UnknownEntry(*id))?;
            if entry.synced {
                continue;
            }
            entry.synced = true;
            batch.put_cf(cf_entries, key, Self::encode(&entry)?);
        }

        if !batch.is_empty() {
            self.write(&mut state, batch)?;
        }
        for id in volatile_hits {
            if let Some(entry) = state.volatile.get_mut(&id) {
                entry.synced = true;
            }
        }
        Ok(())
    }

    /// Delete every synced entry. Returns how many were removed.
    pub fn collect_garbage(&self) -> Result<usize, LedgerError> {
        let mut state = self.state.lock();
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_index = self.cf_handle(CF_INDEX)?;
        let mut batch = WriteBatch::default();
        let mut removed = 0usize;

        for item in self.db.iterator_cf(cf_entries, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            let entry = Self::decode(&value)?;
            if entry.synced {
                batch.delete_cf(cf_entries, &key);
                batch.delete_cf(cf_index, entry.local_id.0.to_be_bytes());
                removed += 1;
            }
        }

        if removed > 0 {
            self.write(&mut state, batch)?;
        }
        let before = state.volatile.len();
        state.volatile.retain(|_, e| !e.synced);
        removed += before - state.volatile.len();

        if removed > 0 {
            info!(removed, "collected synced ledger entries");
        }
        Ok(removed)
    }

    /// Owners that still have unsynced entries.
    pub fn owners_with_unsynced(&self) -> Result<Vec<OwnerId>, LedgerError> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let mut owners = BTreeSet::new();
        for item in self.db.iterator_cf(cf_entries, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            let entry = Self::decode(&value)?;
            if !entry.synced {
                owners.insert(entry.owner_id);
            }
        }
        let state = self.state.lock();
        owners.extend(state.volatile.values().filter(|e| !e.synced).map(|e| e.owner_id));
        Ok(owners.into_iter().collect())
    }

    /// Whether `owner` has anything waiting to be synced.
    pub fn has_unsynced(&self, owner: OwnerId) -> Result<bool, LedgerError> {
        Ok(!self.list_unsynced(owner)?.is_empty())
    }

    /// Look up an entry by id, persisted or in memory.
    pub fn get(&self, local_id: LocalId) -> Result<Option<LedgerEntry>, LedgerError> {
        if let Some(entry) = self.state.lock().volatile.get(&local_id.0) {
            return Ok(Some(entry.clone()));
        }
        let cf_index = self.cf_handle(CF_INDEX)?;
        match self
            .db
            .get_cf(cf_index, local_id.0.to_be_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?
        {
            Some(key) => self.read_entry(&key),
            None => Ok(None),
        }
    }

    /// Number of entries held only in memory.
    pub fn volatile_len(&self) -> usize {
        self.state.lock().volatile.len()
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db
            .flush()
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// Make the next `count` batch writes fail.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_write_failures(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    // --- Internal helpers ---

    /// Retry writing entries that previously failed to persist.
    fn persist_volatile(&self, state: &mut LedgerState) {
        if state.volatile.is_empty() {
            return;
        }
        let pending: Vec<LedgerEntry> = state.volatile.values().cloned().collect();
        let mut batch = WriteBatch::default();
        for entry in &pending {
            match self.stage_into(&mut batch, entry) {
                Ok(()) => {}
                Err(e) => {
                    warn!(local_id = %entry.local_id, error = %e, "cannot stage volatile entry");
                    return;
                }
            }
        }
        if let Err(e) = self.stage_meta(&mut batch, state.next_local_id) {
            warn!(error = %e, "cannot stage ledger counter");
            return;
        }
        match self.write(state, batch) {
            Ok(()) => {
                info!(count = pending.len(), "persisted volatile ledger entries");
                state.volatile.clear();
            }
            Err(e) => debug!(error = %e, "volatile entries still not durable"),
        }
    }

    fn write(&self, _state: &mut LedgerState, batch: WriteBatch) -> Result<(), LedgerError> {
        #[cfg(any(test, feature = "testing"))]
        if _state.failing_writes > 0 {
            _state.failing_writes -= 1;
            return Err(LedgerError::Storage("injected write failure".into()));
        }
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// Build the batch that persists a new entry and advances the counter.
    fn stage_entry(&self, entry: &LedgerEntry, next_local_id: u64) -> Result<WriteBatch, LedgerError> {
        let mut batch = WriteBatch::default();
        self.stage_into(&mut batch, entry)?;
        self.stage_meta(&mut batch, next_local_id)?;
        Ok(batch)
    }

    fn stage_into(&self, batch: &mut WriteBatch, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_index = self.cf_handle(CF_INDEX)?;
        let key = Self::entry_key(entry);
        batch.put_cf(cf_entries, key, Self::encode(entry)?);
        batch.put_cf(cf_index, entry.local_id.0.to_be_bytes(), key);
        Ok(())
    }

    fn stage_meta(&self, batch: &mut WriteBatch, next_local_id: u64) -> Result<(), LedgerError> {
        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(cf_meta, META_NEXT_LOCAL_ID, next_local_id.to_le_bytes());
        Ok(())
    }

    /// All persisted entries of `owner` in key order.
    fn scan_owner(&self, owner: OwnerId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let prefix = owner.0.to_be_bytes();
        let mut result = Vec::new();

        for item in self.db.prefix_iterator_cf(cf_entries, prefix) {
            let (key, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            // Verify the prefix still matches (prefix_iterator may overshoot)
            if key.len() != ENTRY_KEY_LEN || key[0..8] != prefix {
                break;
            }
            result.push(Self::decode(&value)?);
        }
        Ok(result)
    }

    fn entry_key_for(&self, local_id: LocalId) -> Result<Vec<u8>, LedgerError> {
        let cf_index = self.cf_handle(CF_INDEX)?;
        self.db
            .get_cf(cf_index, local_id.0.to_be_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .ok_or(LedgerError::UnknownEntry(local_id))
    }

    fn read_entry(&self, key: &[u8]) -> Result<Option<LedgerEntry>, LedgerError> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        match self
            .db
            .get_cf(cf_entries, key)
            .map_err(|e| LedgerError::Storage(e.to_string()))?
        {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Draw and persist a fresh device id for a new database.
    fn create_device_id(&self) -> Result<DeviceId, LedgerError> {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let device = DeviceId(u64::from_le_bytes(bytes));
        let cf = self.cf_handle(CF_META)?;
        self.db
            .put_cf(cf, META_DEVICE_ID, device.0.to_le_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        info!(%device, "new ledger device id");
        Ok(device)
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<Option<u64>, LedgerError> {
        let cf = self.cf_handle(CF_META)?;
        match self
            .db
            .get_cf(cf, key)
            .map_err(|e| LedgerError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| LedgerError::Storage("invalid metadata value length".into()))?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LedgerError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Storage(format!("missing column family: {name}")))
    }

    /// `owner(BE) || occurred_at(BE, sign-flipped) || local_id(BE)`.
    fn entry_key(entry: &LedgerEntry) -> [u8; ENTRY_KEY_LEN] {
        let mut key = [0u8; ENTRY_KEY_LEN];
        let ts = (entry.occurred_at.timestamp_millis() as u64) ^ (1 << 63);
        key[0..8].copy_from_slice(&entry.owner_id.0.to_be_bytes());
        key[8..16].copy_from_slice(&ts.to_be_bytes());
        key[16..24].copy_from_slice(&entry.local_id.0.to_be_bytes());
        key
    }

    fn encode(entry: &LedgerEntry) -> Result<Vec<u8>, LedgerError> {
        bincode::encode_to_vec(StoredEntry::from(entry), bincode::config::standard())
            .map_err(|e| LedgerError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<LedgerEntry, LedgerError> {
        let (stored, _): (StoredEntry, _) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| LedgerError::Codec(e.to_string()))?;
        stored.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn temp_ledger() -> (DurableLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DurableLedger::open(dir.path().join("ledger")).unwrap();
        (ledger, dir)
    }

    #[test]
    fn device_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = DurableLedger::open(dir.path().join("ledger")).unwrap().device_id();
        let again = DurableLedger::open(dir.path().join("ledger")).unwrap().device_id();
        assert_eq!(first, again);
    }

    #[test]
    fn fresh_databases_get_distinct_devices() {
        let (a, _da) = temp_ledger();
        let (b, _db) = temp_ledger();
        assert_ne!(a.device_id(), b.device_id());
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    const ALICE: OwnerId = OwnerId(1);
    const BOB: OwnerId = OwnerId(2);

    #[test]
    fn append_assigns_increasing_ids() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        let b = ledger.append(BOB, EntryKind::Increment, 6, t(1)).unwrap();
        let c = ledger.append(ALICE, EntryKind::Absolute, 7, t(2)).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn list_unsynced_filters_by_owner() {
        let (ledger, _dir) = temp_ledger();
        ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        ledger.append(BOB, EntryKind::Increment, 6, t(1)).unwrap();
        ledger.append(ALICE, EntryKind::Increment, 7, t(2)).unwrap();

        let alice = ledger.list_unsynced(ALICE).unwrap();
        assert_eq!(alice.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![5, 7]);
        assert!(alice.iter().all(|e| e.owner_id == ALICE));
        assert_eq!(ledger.list_unsynced(BOB).unwrap().len(), 1);
        assert!(ledger.list_unsynced(OwnerId(99)).unwrap().is_empty());
    }

    #[test]
    fn list_orders_by_occurrence_not_append() {
        let (ledger, _dir) = temp_ledger();
        ledger.append(ALICE, EntryKind::Increment, 1, t(50)).unwrap();
        ledger.append(ALICE, EntryKind::Increment, 2, t(10)).unwrap();
        ledger.append(ALICE, EntryKind::Increment, 3, t(30)).unwrap();
        let amounts: Vec<i64> = ledger.list_unsynced(ALICE).unwrap().iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![2, 3, 1]);
    }

    #[test]
    fn same_timestamp_ties_break_by_local_id() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 1, t(5)).unwrap();
        let b = ledger.append(ALICE, EntryKind::Absolute, 2, t(5)).unwrap();
        let ids: Vec<LocalId> = ledger.list_unsynced(ALICE).unwrap().iter().map(|e| e.local_id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn pre_epoch_timestamps_sort_first() {
        let (ledger, _dir) = temp_ledger();
        ledger.append(ALICE, EntryKind::Increment, 1, t(0)).unwrap();
        ledger.append(ALICE, EntryKind::Increment, 2, Utc.timestamp_opt(-10, 0).unwrap()).unwrap();
        let amounts: Vec<i64> = ledger.list_unsynced(ALICE).unwrap().iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![2, 1]);
    }

    #[test]
    fn negative_absolute_rejected() {
        let (ledger, _dir) = temp_ledger();
        let err = ledger.append(ALICE, EntryKind::Absolute, -1, t(0)).unwrap_err();
        assert_eq!(err, LedgerError::Validation(ValidationError::NegativeAbsolute(-1)));
    }

    #[test]
    fn mark_synced_hides_entry() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        let b = ledger.append(ALICE, EntryKind::Increment, 6, t(1)).unwrap();
        ledger.mark_synced(a).unwrap();
        let left = ledger.list_unsynced(ALICE).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].local_id, b);
        // The entry itself survives until garbage collection.
        assert!(ledger.get(a).unwrap().unwrap().synced);
    }

    #[test]
    fn mark_synced_is_idempotent() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        ledger.mark_synced(a).unwrap();
        ledger.mark_synced(a).unwrap();
        assert!(ledger.list_unsynced(ALICE).unwrap().is_empty());
    }

    #[test]
    fn mark_unknown_entry_errors() {
        let (ledger, _dir) = temp_ledger();
        assert_eq!(
            ledger.mark_synced(LocalId(42)).unwrap_err(),
            LedgerError::UnknownEntry(LocalId(42))
        );
    }

    #[test]
    fn failed_batch_marks_nothing() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        let b = ledger.append(ALICE, EntryKind::Increment, 6, t(1)).unwrap();
        ledger.inject_write_failures(1);
        assert!(ledger.mark_all_synced(&[a, b]).is_err());
        assert_eq!(ledger.list_unsynced(ALICE).unwrap().len(), 2);
    }

    #[test]
    fn garbage_collection_removes_only_synced() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        let b = ledger.append(ALICE, EntryKind::Increment, 6, t(1)).unwrap();
        ledger.mark_synced(a).unwrap();
        assert_eq!(ledger.collect_garbage().unwrap(), 1);
        assert!(ledger.get(a).unwrap().is_none());
        assert_eq!(ledger.get(b).unwrap().unwrap().amount, 6);
        assert_eq!(ledger.collect_garbage().unwrap(), 0);
    }

    #[test]
    fn owners_with_unsynced_lists_pending_owners() {
        let (ledger, _dir) = temp_ledger();
        let a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
        ledger.append(BOB, EntryKind::Increment, 6, t(1)).unwrap();
        assert_eq!(ledger.owners_with_unsynced().unwrap(), vec![ALICE, BOB]);
        ledger.mark_synced(a).unwrap();
        assert_eq!(ledger.owners_with_unsynced().unwrap(), vec![BOB]);
        assert!(!ledger.has_unsynced(ALICE).unwrap());
    }

    #[test]
    fn failed_write_keeps_entry_in_memory() {
        let (ledger, _dir) = temp_ledger();
        ledger.inject_write_failures(1);
        let err = ledger.append(ALICE, EntryKind::Increment, 9, t(0)).unwrap_err();
        let LedgerError::NotDurable { local_id, .. } = err else {
            panic!("expected NotDurable, got {err:?}");
        };
        assert_eq!(ledger.volatile_len(), 1);
        let listed = ledger.list_unsynced(ALICE).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].local_id, local_id);
    }

    #[test]
    fn volatile_entries_persist_on_next_append() {
        let (ledger, _dir) = temp_ledger();
        ledger.inject_write_failures(1);
        let _ = ledger.append(ALICE, EntryKind::Increment, 9, t(0));
        ledger.append(ALICE, EntryKind::Increment, 10, t(1)).unwrap();
        assert_eq!(ledger.volatile_len(), 0);
        assert_eq!(ledger.list_unsynced(ALICE).unwrap().len(), 2);
    }

    #[test]
    fn volatile_entry_can_be_marked_and_collected() {
        let (ledger, _dir) = temp_ledger();
        ledger.inject_write_failures(1);
        let Err(LedgerError::NotDurable { local_id, .. }) =
            ledger.append(ALICE, EntryKind::Increment, 9, t(0))
        else {
            panic!("expected NotDurable");
        };
        ledger.mark_synced(local_id).unwrap();
        assert!(ledger.list_unsynced(ALICE).unwrap().is_empty());
        assert_eq!(ledger.collect_garbage().unwrap(), 1);
        assert_eq!(ledger.volatile_len(), 0);
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        let (a, b);
        {
            let ledger = DurableLedger::open(&path).unwrap();
            a = ledger.append(ALICE, EntryKind::Increment, 5, t(0)).unwrap();
            b = ledger.append(ALICE, EntryKind::Absolute, 50, t(1)).unwrap();
            ledger.mark_synced(a).unwrap();
            ledger.flush().unwrap();
        }
        let ledger = DurableLedger::open(&path).unwrap();
        let left = ledger.list_unsynced(ALICE).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].local_id, b);
        assert_eq!(left[0].kind, EntryKind::Absolute);
        assert_eq!(left[0].occurred_at, t(1));
        // The counter survives the restart: ids never repeat.
        let c = ledger.append(ALICE, EntryKind::Increment, 1, t(2)).unwrap();
        assert!(c > b);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn listing_is_sorted_by_time(offsets in prop::collection::vec(-1_000i64..1_000, 1..20)) {
            let (ledger, _dir) = temp_ledger();
            for (i, off) in offsets.iter().enumerate() {
                ledger.append(ALICE, EntryKind::Increment, i as i64, t(0) + Duration::seconds(*off)).unwrap();
            }
            let listed = ledger.list_unsynced(ALICE).unwrap();
            prop_assert_eq!(listed.len(), offsets.len());
            for pair in listed.windows(2) {
                prop_assert!((pair[0].occurred_at, pair[0].local_id) < (pair[1].occurred_at, pair[1].local_id));
            }
        }
    }
}
