//! Owned state of the index store.
//!
//! The in-memory maps are the serving copy; every apply also writes the
//! touched records to the `kv_index` / `kv_rev` column families so
//! [`KvStore::recover`] can rebuild the maps on restart. Apply handlers are
//! only called by the state machine, one command at a time; readers go
//! through the [`KvReader`] view and never block on each other.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::index::{compact, KvIndex};
use super::{in_range, Kv, KvError, KvIndexEvent, KvIndexIncrement, KvResult, KvRevision};
use crate::lease::LeaseManager;
use crate::storage::backend::{RawEngine, WriteBatch, CF_KV_INDEX, CF_KV_REV, CF_META};
use crate::storage::Revision;
use crate::watch::{EventType, WatchEvent};

const REVISION_KEY: &[u8] = b"kv_revision";
const COMPACT_REVISION_KEY: &[u8] = b"kv_compact_revision";

/// A watch event produced by an apply, to be dispatched for `key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedEvent {
    pub key: Vec<u8>,
    pub event: WatchEvent,
}

/// What one or more applies produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub events: Vec<AppliedEvent>,
    /// Local persistence failures after the in-memory apply succeeded.
    pub warnings: Vec<String>,
}

impl ApplyReport {
    fn merge(&mut self, other: ApplyReport) {
        self.events.extend(other.events);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Default)]
struct KvState {
    kv_index: BTreeMap<Vec<u8>, KvIndex>,
    kv_rev: BTreeMap<Revision, KvRevision>,
}

pub struct KvStore {
    engine: Arc<dyn RawEngine>,
    leases: Arc<LeaseManager>,
    state: RwLock<KvState>,
    /// Highest main revision applied.
    revision: AtomicI64,
    /// Highest compact revision applied.
    compact_revision: AtomicI64,
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

impl KvStore {
    pub fn new(engine: Arc<dyn RawEngine>, leases: Arc<LeaseManager>) -> Self {
        Self {
            engine,
            leases,
            state: RwLock::new(KvState::default()),
            revision: AtomicI64::new(0),
            compact_revision: AtomicI64::new(0),
        }
    }

    /// Reloads both maps and the revision marks from the column families.
    pub fn recover(&self) -> KvResult<()> {
        let mut state = KvState::default();

        for item in self.engine.scan(CF_KV_INDEX, &[], &[], false)? {
            let (key, value) = item?;
            let index: KvIndex = bincode::deserialize(&value)?;
            state.kv_index.insert(key, index);
        }

        let mut max_main = 0;
        for item in self.engine.scan(CF_KV_REV, &[], &[], false)? {
            let (key, value) = item?;
            let revision = Revision::decode(&key)?;
            let record: KvRevision = bincode::deserialize(&value)?;
            max_main = max_main.max(revision.main);
            state.kv_rev.insert(revision, record);
        }

        if let Some(bytes) = self.engine.get(CF_META, REVISION_KEY)? {
            max_main = max_main.max(decode_i64(&bytes).unwrap_or(0));
        }
        if let Some(bytes) = self.engine.get(CF_META, COMPACT_REVISION_KEY)? {
            self.compact_revision
                .store(decode_i64(&bytes).unwrap_or(0), Ordering::Release);
        }
        self.revision.store(max_main, Ordering::Release);

        info!(
            keys = state.kv_index.len(),
            revisions = state.kv_rev.len(),
            revision = max_main,
            "Index store recovered"
        );
        *self.state.write() = state;
        Ok(())
    }

    pub fn reader(self: &Arc<Self>) -> KvReader {
        KvReader { store: self.clone() }
    }

    pub fn current_revision(&self) -> i64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn compact_revision(&self) -> i64 {
        self.compact_revision.load(Ordering::Acquire)
    }

    /// Applies one command's increments in order.
    ///
    /// The lease of every put, including leases inherited through
    /// `ignore_lease`, is checked before anything is applied, so a rejected
    /// command leaves the store untouched.
    pub fn apply(&self, increments: &[KvIndexIncrement]) -> KvResult<ApplyReport> {
        self.check_leases(increments)?;

        let mut report = ApplyReport::default();
        for increment in increments {
            let applied = match &increment.event {
                KvIndexEvent::Put {
                    value,
                    lease,
                    ignore_lease,
                    ignore_value,
                } => self.put(
                    &increment.key,
                    increment.op_revision,
                    value,
                    *lease,
                    *ignore_lease,
                    *ignore_value,
                )?,
                KvIndexEvent::Delete => self.apply_delete(&increment.key, increment.op_revision),
                KvIndexEvent::Compaction => self.apply_compact(&increment.key, increment.op_revision),
            };
            report.merge(applied);
        }
        Ok(report)
    }

    /// Resolves the lease each put will carry, following earlier increments
    /// of the same command, and fails on the first one that does not exist.
    fn check_leases(&self, increments: &[KvIndexIncrement]) -> KvResult<()> {
        let state = self.state.read();
        let mut pending: HashMap<&[u8], i64> = HashMap::new();
        for increment in increments {
            let key = increment.key.as_slice();
            match &increment.event {
                KvIndexEvent::Put {
                    lease, ignore_lease, ..
                } => {
                    let lease = if *ignore_lease {
                        match pending.get(key) {
                            Some(lease) => *lease,
                            None => Self::current_lease(&state, key),
                        }
                    } else {
                        *lease
                    };
                    if lease > 0 && !self.leases.exists(lease) {
                        return Err(KvError::LeaseNotFound(lease));
                    }
                    pending.insert(key, lease);
                }
                KvIndexEvent::Delete => {
                    pending.insert(key, 0);
                }
                KvIndexEvent::Compaction => {}
            }
        }
        Ok(())
    }

    fn current_lease(state: &KvState, key: &[u8]) -> i64 {
        state
            .kv_index
            .get(key)
            .and_then(|index| state.kv_rev.get(&index.mod_revision))
            .map_or(0, |record| record.lease)
    }

    /// Records a put of `key` at `op_revision`.
    pub fn apply_put(
        &self,
        key: &[u8],
        op_revision: Revision,
        value: &[u8],
        lease: i64,
        ignore_lease: bool,
        ignore_value: bool,
    ) -> KvResult<ApplyReport> {
        let effective = if ignore_lease {
            Self::current_lease(&self.state.read(), key)
        } else {
            lease
        };
        if effective > 0 && !self.leases.exists(effective) {
            return Err(KvError::LeaseNotFound(effective));
        }
        self.put(key, op_revision, value, lease, ignore_lease, ignore_value)
    }

    // Lease existence is the caller's check.
    fn put(
        &self,
        key: &[u8],
        op_revision: Revision,
        value: &[u8],
        lease: i64,
        ignore_lease: bool,
        ignore_value: bool,
    ) -> KvResult<ApplyReport> {
        let mut state = self.state.write();

        let previous = state.kv_index.get(key).cloned();
        let last_record = previous
            .as_ref()
            .and_then(|index| state.kv_rev.get(&index.mod_revision))
            .cloned();
        let mut index = previous.unwrap_or_else(|| KvIndex::new(key));
        let lifecycle = index.put(op_revision);

        let last_lease = last_record.as_ref().map_or(0, |r| r.lease);
        let lease = if ignore_lease { last_lease } else { lease };
        let value = match (&last_record, ignore_value) {
            (Some(last), true) => last.value.clone(),
            _ => value.to_vec(),
        };

        let record = KvRevision {
            key: key.to_vec(),
            value,
            create_revision: lifecycle.create_revision,
            mod_revision: op_revision,
            version: lifecycle.version,
            lease,
            is_deleted: false,
        };

        let mut batch = WriteBatch::new();
        batch.put(CF_KV_INDEX, key.to_vec(), bincode::serialize(&index)?);
        batch.put(CF_KV_REV, op_revision.encode(), bincode::serialize(&record)?);
        batch.put(CF_META, REVISION_KEY.to_vec(), op_revision.main.to_be_bytes().to_vec());

        let prev_kv = match (lifecycle.prev, &last_record) {
            (Some(_), Some(last)) if !last.is_deleted => Some(last.to_kv(false)),
            _ => None,
        };
        let event = AppliedEvent {
            key: key.to_vec(),
            event: WatchEvent {
                event_type: EventType::Put,
                kv: record.to_kv(false),
                prev_kv,
            },
        };

        state.kv_index.insert(key.to_vec(), index);
        state.kv_rev.insert(op_revision, record);
        self.revision.fetch_max(op_revision.main, Ordering::AcqRel);
        drop(state);

        if lease > 0 {
            // A lease revoked since the check loses the attach; the writer cleans up.
            if let Err(e) = self.leases.attach_keys(lease, [key.to_vec()]) {
                debug!(lease, error = %e, "Lease vanished before key attach");
            }
        }

        debug!(key = ?String::from_utf8_lossy(key), revision = %op_revision, "Index store put applied");
        let mut report = self.persist(batch, "put");
        report.events.push(event);
        Ok(report)
    }

    /// Records a delete of `key` at `op_revision`. Keys that are missing or
    /// already deleted are left alone.
    pub fn apply_delete(&self, key: &[u8], op_revision: Revision) -> ApplyReport {
        let mut state = self.state.write();

        let Some(mut index) = state.kv_index.get(key).cloned() else {
            debug!(key = ?String::from_utf8_lossy(key), "Delete of unknown key, nothing to do");
            return ApplyReport::default();
        };
        let last_record = state.kv_rev.get(&index.mod_revision).cloned();
        let Some(lifecycle) = index.tombstone(op_revision) else {
            debug!(key = ?String::from_utf8_lossy(key), "Key already deleted, nothing to do");
            return ApplyReport::default();
        };

        let record = KvRevision {
            key: key.to_vec(),
            value: Vec::new(),
            create_revision: lifecycle.create_revision,
            mod_revision: op_revision,
            version: lifecycle.version,
            lease: 0,
            is_deleted: true,
        };

        let mut batch = WriteBatch::new();
        let encoded = match (bincode::serialize(&index), bincode::serialize(&record)) {
            (Ok(index_bytes), Ok(record_bytes)) => Some((index_bytes, record_bytes)),
            _ => None,
        };
        if let Some((index_bytes, record_bytes)) = encoded {
            batch.put(CF_KV_INDEX, key.to_vec(), index_bytes);
            batch.put(CF_KV_REV, op_revision.encode(), record_bytes);
            batch.put(CF_META, REVISION_KEY.to_vec(), op_revision.main.to_be_bytes().to_vec());
        }

        let prev_kv = last_record.as_ref().map(|r| r.to_kv(false));
        let event = AppliedEvent {
            key: key.to_vec(),
            event: WatchEvent {
                event_type: EventType::Delete,
                kv: record.to_kv(false),
                prev_kv,
            },
        };

        state.kv_index.insert(key.to_vec(), index);
        state.kv_rev.insert(op_revision, record);
        self.revision.fetch_max(op_revision.main, Ordering::AcqRel);
        drop(state);

        if let Some(lease) = last_record.map(|r| r.lease).filter(|lease| *lease > 0) {
            let mut detach = HashMap::new();
            detach.insert(lease, vec![key.to_vec()]);
            self.leases.detach_keys(&detach);
        }

        debug!(key = ?String::from_utf8_lossy(key), revision = %op_revision, "Index store delete applied");
        let mut report = if batch.is_empty() {
            ApplyReport {
                events: Vec::new(),
                warnings: vec!["failed to encode deleted key index".to_string()],
            }
        } else {
            self.persist(batch, "delete")
        };
        report.events.push(event);
        report
    }

    /// Drops history of `key` released by `compact_revision`.
    pub fn apply_compact(&self, key: &[u8], compact_revision: Revision) -> ApplyReport {
        let mut state = self.state.write();

        let Some(index) = state.kv_index.get(key) else {
            debug!(key = ?String::from_utf8_lossy(key), "Compaction of unknown key, skipped");
            return ApplyReport::default();
        };
        let (rebuilt, released) = compact(index, compact_revision);

        let mut batch = WriteBatch::new();
        match rebuilt {
            Some(rebuilt) => {
                match bincode::serialize(&rebuilt) {
                    Ok(bytes) => batch.put(CF_KV_INDEX, key.to_vec(), bytes),
                    Err(e) => error!(error = %e, "Failed to encode compacted key index"),
                }
                state.kv_index.insert(key.to_vec(), rebuilt);
            }
            None => {
                batch.delete(CF_KV_INDEX, key.to_vec());
                state.kv_index.remove(key);
            }
        }
        for revision in &released {
            state.kv_rev.remove(revision);
            batch.delete(CF_KV_REV, revision.encode());
        }
        let previous = self
            .compact_revision
            .fetch_max(compact_revision.main, Ordering::AcqRel);
        if compact_revision.main > previous {
            batch.put(
                CF_META,
                COMPACT_REVISION_KEY.to_vec(),
                compact_revision.main.to_be_bytes().to_vec(),
            );
        }
        drop(state);

        debug!(
            key = ?String::from_utf8_lossy(key),
            released = released.len(),
            revision = %compact_revision,
            "Index store compaction applied"
        );
        self.persist(batch, "compaction")
    }

    fn persist(&self, batch: WriteBatch, what: &str) -> ApplyReport {
        let mut report = ApplyReport::default();
        if let Err(e) = self.engine.write(batch) {
            error!(error = %e, op = what, "Failed to persist index store after apply");
            report.warnings.push(format!("{} applied but not persisted: {}", what, e));
        }
        report
    }
}

/// Read-only view over a [`KvStore`].
#[derive(Clone)]
pub struct KvReader {
    store: Arc<KvStore>,
}

impl KvReader {
    pub fn get_raw_kv_index(&self, key: &[u8]) -> Option<KvIndex> {
        self.store.state.read().kv_index.get(key).cloned()
    }

    /// Live keys in the range, in key order.
    pub fn range_raw_kv_index(&self, key: &[u8], range_end: &[u8]) -> Vec<KvIndex> {
        let state = self.store.state.read();
        if range_end.is_empty() {
            return state
                .kv_index
                .get(key)
                .filter(|index| index.is_live())
                .cloned()
                .into_iter()
                .collect();
        }
        state
            .kv_index
            .range(key.to_vec()..)
            .take_while(|(k, _)| in_range(k, key, range_end))
            .filter(|(_, index)| index.is_live())
            .map(|(_, index)| index.clone())
            .collect()
    }

    pub fn get_raw_kv_rev(&self, revision: &Revision) -> Option<KvRevision> {
        self.store.state.read().kv_rev.get(revision).cloned()
    }

    /// Visible version of every key in the range as of main revision `at`.
    ///
    /// Fails with `Compacted` when a needed record was released by compaction.
    pub fn range_at(&self, key: &[u8], range_end: &[u8], at: i64) -> KvResult<Vec<Kv>> {
        let compacted = self.store.compact_revision();
        let too_old = KvError::Compacted {
            requested: at,
            compacted,
        };
        if at < compacted {
            return Err(too_old);
        }
        let state = self.store.state.read();
        let mut kvs = Vec::new();

        let candidates: Vec<&KvIndex> = if range_end.is_empty() {
            state.kv_index.get(key).into_iter().collect()
        } else {
            state
                .kv_index
                .range(key.to_vec()..)
                .take_while(|(k, _)| in_range(k, key, range_end))
                .map(|(_, index)| index)
                .collect()
        };

        for index in candidates {
            let Some(revision) = index.revision_at(at) else {
                // A lifecycle that had started by `at` but whose early
                // revisions were released cannot answer the read.
                let released = index.generations.iter().any(|g| {
                    g.create_revision.map_or(false, |c| c.main <= at)
                        && g.revisions.first().map_or(false, |r| r.main > at)
                });
                if released {
                    return Err(too_old);
                }
                continue;
            };
            match state.kv_rev.get(&revision) {
                Some(record) if !record.is_deleted => kvs.push(record.to_kv(false)),
                Some(_) => {}
                None => return Err(too_old),
            }
        }
        Ok(kvs)
    }

    /// Every key with an index entry, live or not.
    pub fn all_keys(&self) -> Vec<Vec<u8>> {
        self.store.state.read().kv_index.keys().cloned().collect()
    }

    pub fn current_revision(&self) -> i64 {
        self.store.current_revision()
    }

    pub fn compact_revision(&self) -> i64 {
        self.store.compact_revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseExpireEvent;
    use crate::storage::backend::{BackendConfig, MemoryEngine, SledEngine};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn leases() -> (Arc<LeaseManager>, mpsc::Receiver<LeaseExpireEvent>) {
        let (tx, rx) = mpsc::channel(4);
        (Arc::new(LeaseManager::new(tx)), rx)
    }

    fn store() -> (Arc<KvStore>, Arc<LeaseManager>) {
        let (leases, _rx) = leases();
        (Arc::new(KvStore::new(MemoryEngine::new(), leases.clone())), leases)
    }

    fn rev(main: i64) -> Revision {
        Revision::new(main, 0)
    }

    #[test]
    fn test_put_reports_prev_kv() {
        let (store, _) = store();

        let first = store.apply_put(b"a", rev(1), b"1", 0, false, false).unwrap();
        assert_eq!(first.events[0].event.prev_kv, None);
        assert_eq!(first.events[0].event.kv.version, 1);

        let second = store.apply_put(b"a", rev(2), b"2", 0, false, false).unwrap();
        let event = &second.events[0].event;
        assert_eq!(event.event_type, EventType::Put);
        assert_eq!(event.kv.create_revision, 1);
        assert_eq!(event.kv.mod_revision, 2);
        assert_eq!(event.kv.version, 2);
        assert_eq!(event.prev_kv.as_ref().unwrap().value, b"1");
        assert_eq!(store.current_revision(), 2);
    }

    #[test]
    fn test_ignore_value_keeps_previous_value() {
        let (store, _) = store();
        store.apply_put(b"a", rev(1), b"keep", 0, false, false).unwrap();
        store.apply_put(b"a", rev(2), b"", 0, false, true).unwrap();

        let reader = store.reader();
        let record = reader.get_raw_kv_rev(&rev(2)).unwrap();
        assert_eq!(record.value, b"keep");
    }

    #[test]
    fn test_put_with_missing_lease_rejected() {
        let (store, _) = store();
        let increments = vec![
            KvIndexIncrement::put(b"a".to_vec(), b"1".to_vec(), 0, rev(1)),
            KvIndexIncrement::put(b"b".to_vec(), b"2".to_vec(), 77, Revision::new(1, 1)),
        ];

        assert!(matches!(store.apply(&increments), Err(KvError::LeaseNotFound(77))));
        assert!(store.reader().get_raw_kv_index(b"a").is_none());
    }

    #[test]
    fn test_inherited_lease_checked_before_apply() {
        let (store, leases) = store();
        let lease = leases.grant(7, 60).unwrap();
        store.apply_put(b"a", rev(1), b"1", lease.id, false, false).unwrap();
        leases.revoke(lease.id).unwrap();

        let increments = vec![
            KvIndexIncrement::put(b"b".to_vec(), b"2".to_vec(), 0, rev(2)),
            KvIndexIncrement {
                key: b"a".to_vec(),
                event: KvIndexEvent::Put {
                    value: b"3".to_vec(),
                    lease: 0,
                    ignore_lease: true,
                    ignore_value: false,
                },
                op_revision: Revision::new(2, 1),
            },
        ];
        assert!(matches!(store.apply(&increments), Err(KvError::LeaseNotFound(7))));
        assert!(store.reader().get_raw_kv_index(b"b").is_none());
        assert_eq!(store.current_revision(), 1);

        // a delete earlier in the same command clears the inherited lease
        let increments = vec![
            KvIndexIncrement::delete(b"a".to_vec(), rev(2)),
            KvIndexIncrement {
                key: b"a".to_vec(),
                event: KvIndexEvent::Put {
                    value: b"4".to_vec(),
                    lease: 0,
                    ignore_lease: true,
                    ignore_value: false,
                },
                op_revision: Revision::new(2, 1),
            },
        ];
        store.apply(&increments).unwrap();
        assert_eq!(store.reader().get_raw_kv_rev(&Revision::new(2, 1)).unwrap().lease, 0);
    }

    #[test]
    fn test_lease_attach_and_detach() {
        let (store, leases) = store();
        let lease = leases.grant(0, 60).unwrap();

        store.apply_put(b"a", rev(1), b"1", lease.id, false, false).unwrap();
        assert_eq!(leases.query(lease.id, true).unwrap().keys, vec![b"a".to_vec()]);

        store.apply_delete(b"a", rev(2));
        assert!(leases.query(lease.id, true).unwrap().keys.is_empty());
    }

    #[test]
    fn test_delete_lifecycle_and_range() {
        let (store, _) = store();
        store.apply_put(b"x", rev(1), b"1", 0, false, false).unwrap();
        let report = store.apply_delete(b"x", rev(2));
        assert_eq!(report.events[0].event.event_type, EventType::Delete);
        assert_eq!(report.events[0].event.prev_kv.as_ref().unwrap().value, b"1");

        let reader = store.reader();
        assert!(reader.range_raw_kv_index(b"x", b"").is_empty());

        // second delete is a no-op
        assert!(store.apply_delete(b"x", rev(3)).events.is_empty());

        store.apply_compact(b"x", rev(3));
        assert!(reader.get_raw_kv_index(b"x").is_none());
        assert!(reader.get_raw_kv_rev(&rev(1)).is_none());
        assert!(reader.get_raw_kv_rev(&rev(2)).is_none());
        assert_eq!(reader.compact_revision(), 3);
    }

    #[test]
    fn test_range_and_range_at() {
        let (store, _) = store();
        store.apply_put(b"a", rev(1), b"a1", 0, false, false).unwrap();
        store.apply_put(b"b", rev(2), b"b1", 0, false, false).unwrap();
        store.apply_put(b"a", rev(3), b"a2", 0, false, false).unwrap();
        store.apply_delete(b"b", rev(4));

        let reader = store.reader();
        let live: Vec<Vec<u8>> = reader
            .range_raw_kv_index(b"a", super::super::RANGE_END_ALL)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(live, vec![b"a".to_vec()]);

        let at2 = reader.range_at(b"a", b"c", 2).unwrap();
        assert_eq!(at2.len(), 2);
        assert_eq!(at2[0].value, b"a1");
        assert_eq!(at2[1].value, b"b1");

        store.apply_compact(b"a", rev(3));
        assert!(matches!(reader.range_at(b"a", b"", 2), Err(KvError::Compacted { .. })));
        assert_eq!(reader.range_at(b"a", b"", 3).unwrap()[0].value, b"a2");
    }

    #[test]
    fn test_recover_from_sled() {
        let temp_dir = TempDir::new().unwrap();
        let config = BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        {
            let (leases, _rx) = leases();
            let store = KvStore::new(SledEngine::open(&config).unwrap(), leases);
            store.apply_put(b"a", rev(1), b"1", 0, false, false).unwrap();
            store.apply_put(b"b", rev(2), b"2", 0, false, false).unwrap();
            store.apply_delete(b"b", rev(3));
            store.apply_compact(b"b", rev(4));
        }

        let (leases, _rx) = leases();
        let store = Arc::new(KvStore::new(SledEngine::open(&config).unwrap(), leases));
        store.recover().unwrap();
        let reader = store.reader();

        assert_eq!(reader.current_revision(), 3);
        assert_eq!(reader.compact_revision(), 4);
        assert_eq!(reader.all_keys(), vec![b"a".to_vec()]);
        assert_eq!(reader.get_raw_kv_rev(&rev(1)).unwrap().value, b"1");
    }
}
