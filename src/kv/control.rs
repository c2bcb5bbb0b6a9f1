//! Request-facing API of the index store.
//!
//! `KvControl` validates requests, allocates revisions and turns each request
//! into [`KvIndexIncrement`]s submitted through consensus. It never touches
//! the store's maps directly; reads go through a [`KvReader`] and writes land
//! when the state machine applies the command.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{Kv, KvError, KvIndex, KvIndexEvent, KvIndexIncrement, KvReader, KvResult};
use crate::consensus::{Command, ConsensusEngine};
use crate::lease::LeaseManager;
use crate::storage::Revision;

/// Limits and compaction policy.
#[derive(Clone, Debug)]
pub struct KvControlConfig {
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub auto_compaction: bool,
    /// Revisions kept behind the current one by the compaction task.
    pub compaction_retention_rev_count: i64,
    /// Keys per compaction command.
    pub compaction_batch_size: usize,
}

impl Default for KvControlConfig {
    fn default() -> Self {
        Self {
            max_key_size: 4096,
            max_value_size: 8192,
            auto_compaction: false,
            compaction_retention_rev_count: 1000,
            compaction_batch_size: 50,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: i64,
    /// Return the version replaced by this put.
    pub prev_kv: bool,
    /// Keep the current value; the key must exist.
    pub ignore_value: bool,
    /// Keep the current lease; the key must exist.
    pub ignore_lease: bool,
}

impl PutRequest {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub revision: i64,
    pub prev_kv: Option<Kv>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub kvs: Vec<Kv>,
    /// Live keys in the range, regardless of `limit`.
    pub count: i64,
    /// Set when `limit` cut the result short.
    pub more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteRangeResponse {
    pub deleted: i64,
    pub prev_kvs: Vec<Kv>,
    pub revision: i64,
}

pub struct KvControl {
    config: KvControlConfig,
    reader: KvReader,
    leases: Arc<LeaseManager>,
    consensus: Arc<dyn ConsensusEngine>,
    /// Last allocated main revision.
    revision: AtomicI64,
    // Allocation and submission happen together so apply order matches
    // revision order.
    submit_latch: Mutex<()>,
}

impl KvControl {
    pub fn new(
        config: KvControlConfig,
        reader: KvReader,
        leases: Arc<LeaseManager>,
        consensus: Arc<dyn ConsensusEngine>,
    ) -> Self {
        let revision = AtomicI64::new(reader.current_revision());
        Self {
            config,
            reader,
            leases,
            consensus,
            revision,
            submit_latch: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &KvControlConfig {
        &self.config
    }

    pub fn current_revision(&self) -> i64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn compact_revision(&self) -> i64 {
        self.reader.compact_revision()
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Submits a command that consumed main revision `main`. A rejected
    /// command hands the revision back. Caller holds `submit_latch`.
    fn submit_at(&self, main: i64, increments: Vec<KvIndexIncrement>) -> KvResult<()> {
        self.submit(increments).map_err(|e| {
            self.revision.store(main - 1, Ordering::Release);
            warn!(revision = main, error = %e, "Command rejected, revision released");
            e
        })
    }

    fn submit(&self, increments: Vec<KvIndexIncrement>) -> KvResult<()> {
        let outcome = self.consensus.submit_sync(Command::KvIndex(increments))?;
        for warning in &outcome.warnings {
            warn!(warning = %warning, "Index store command applied with warning");
        }
        Ok(())
    }

    /// Current version of `key` if it is live.
    fn live_kv(&self, key: &[u8], keys_only: bool) -> Option<Kv> {
        let index = self.reader.get_raw_kv_index(key)?;
        if !index.is_live() {
            return None;
        }
        self.record_of(&index, keys_only)
    }

    fn record_of(&self, index: &KvIndex, keys_only: bool) -> Option<Kv> {
        match self.reader.get_raw_kv_rev(&index.mod_revision) {
            Some(record) => Some(record.to_kv(keys_only)),
            None => {
                error!(
                    key = ?String::from_utf8_lossy(&index.id),
                    revision = %index.mod_revision,
                    "Revision record missing for live key"
                );
                None
            }
        }
    }

    /// Live keys in `[key, range_end)`; an empty `range_end` is an exact match
    /// and `"\0"` means "to the end". `limit == 0` is unlimited.
    pub fn kv_range(
        &self,
        key: &[u8],
        range_end: &[u8],
        limit: usize,
        keys_only: bool,
        count_only: bool,
    ) -> KvResult<RangeResponse> {
        let indexes = self.reader.range_raw_kv_index(key, range_end);
        let count = indexes.len() as i64;
        let limit = if limit == 0 { usize::MAX } else { limit };

        let mut response = RangeResponse {
            kvs: Vec::new(),
            count,
            more: indexes.len() > limit,
        };
        if count_only {
            return Ok(response);
        }
        response.kvs = indexes
            .iter()
            .take(limit)
            .filter_map(|index| self.record_of(index, keys_only))
            .collect();

        debug!(kvs = response.kvs.len(), count, "Range served");
        Ok(response)
    }

    /// Range as of main revision `revision` (0 reads the current state).
    pub fn kv_range_at(&self, key: &[u8], range_end: &[u8], revision: i64) -> KvResult<Vec<Kv>> {
        let current = self.current_revision();
        if revision > current {
            return Err(KvError::FutureRevision {
                requested: revision,
                current,
            });
        }
        let at = if revision <= 0 { current } else { revision };
        self.reader.range_at(key, range_end, at)
    }

    /// Live keys in the range.
    pub fn kv_range_raw_keys(&self, key: &[u8], range_end: &[u8]) -> Vec<Vec<u8>> {
        self.reader
            .range_raw_kv_index(key, range_end)
            .into_iter()
            .map(|index| index.id)
            .collect()
    }

    fn validate_put(&self, request: &PutRequest) -> KvResult<()> {
        if request.key.is_empty() {
            return Err(KvError::KeyEmpty);
        }
        if request.key.len() > self.config.max_key_size {
            return Err(KvError::KeyTooLong {
                len: request.key.len(),
                max: self.config.max_key_size,
            });
        }
        if !request.ignore_value {
            if request.value.is_empty() {
                return Err(KvError::ValueEmpty);
            }
            if request.value.len() > self.config.max_value_size {
                return Err(KvError::ValueTooLong {
                    len: request.value.len(),
                    max: self.config.max_value_size,
                });
            }
        }
        if !request.ignore_lease && request.lease != 0 && !self.leases.exists(request.lease) {
            return Err(KvError::LeaseNotFound(request.lease));
        }
        Ok(())
    }

    pub fn kv_put(&self, request: PutRequest) -> KvResult<PutResponse> {
        self.validate_put(&request)?;

        let _guard = self.submit_latch.lock();
        let current = self.live_kv(&request.key, false);
        let missing = || KvError::KeyNotFound(String::from_utf8_lossy(&request.key).into_owned());

        match &current {
            None if request.ignore_lease || request.ignore_value => return Err(missing()),
            Some(kv) if !request.ignore_lease && kv.lease != request.lease => {
                return Err(KvError::LeaseMismatch {
                    current: kv.lease,
                    requested: request.lease,
                });
            }
            _ => {}
        }

        let revision = self.next_revision();
        let increment = KvIndexIncrement {
            key: request.key.clone(),
            event: KvIndexEvent::Put {
                value: if request.ignore_value { Vec::new() } else { request.value },
                lease: request.lease,
                ignore_lease: request.ignore_lease,
                ignore_value: request.ignore_value,
            },
            op_revision: Revision::new(revision, 0),
        };
        self.submit_at(revision, vec![increment])?;

        // A lease revoked or expired while the put was in flight never saw
        // the key; drop it so it does not outlive its lease.
        let lease = match &current {
            Some(kv) if request.ignore_lease => kv.lease,
            _ => request.lease,
        };
        if lease > 0 && !self.leases.exists(lease) {
            warn!(
                key = ?String::from_utf8_lossy(&request.key),
                lease,
                "Lease gone during put, deleting key"
            );
            let live: Vec<KvIndex> = self
                .reader
                .get_raw_kv_index(&request.key)
                .filter(|index| index.is_live())
                .into_iter()
                .collect();
            self.delete_indexes(live, false)?;
        }

        debug!(key = ?String::from_utf8_lossy(&request.key), revision, "Put committed");
        Ok(PutResponse {
            revision,
            prev_kv: if request.prev_kv { current } else { None },
        })
    }

    /// Deletes every live key in the range under one main revision.
    pub fn kv_delete_range(&self, key: &[u8], range_end: &[u8], prev_kv: bool) -> KvResult<DeleteRangeResponse> {
        let _guard = self.submit_latch.lock();
        let live = self.reader.range_raw_kv_index(key, range_end);
        self.delete_indexes(live, prev_kv)
    }

    /// Deletes the given keys that are still live. Used when a lease goes away.
    pub fn delete_keys(&self, keys: &[Vec<u8>]) -> KvResult<DeleteRangeResponse> {
        let _guard = self.submit_latch.lock();
        let live: Vec<KvIndex> = keys
            .iter()
            .filter_map(|key| self.reader.get_raw_kv_index(key))
            .filter(|index| index.is_live())
            .collect();
        self.delete_indexes(live, false)
    }

    // Caller holds `submit_latch`.
    fn delete_indexes(&self, live: Vec<KvIndex>, prev_kv: bool) -> KvResult<DeleteRangeResponse> {
        if live.is_empty() {
            return Ok(DeleteRangeResponse {
                revision: self.current_revision(),
                ..Default::default()
            });
        }

        let prev_kvs: Vec<Kv> = if prev_kv {
            live.iter().filter_map(|index| self.record_of(index, false)).collect()
        } else {
            Vec::new()
        };

        let main = self.next_revision();
        let increments: Vec<KvIndexIncrement> = live
            .into_iter()
            .enumerate()
            .map(|(sub, index)| KvIndexIncrement::delete(index.id, Revision::new(main, sub as i64)))
            .collect();
        let deleted = increments.len() as i64;
        self.submit_at(main, increments)?;

        debug!(deleted, revision = main, "Delete range committed");
        Ok(DeleteRangeResponse {
            deleted,
            prev_kvs,
            revision: main,
        })
    }

    /// Revokes a lease and deletes the keys attached to it.
    pub fn lease_revoke(&self, lease_id: i64) -> KvResult<i64> {
        let keys = self
            .leases
            .revoke(lease_id)
            .map_err(|_| KvError::LeaseNotFound(lease_id))?;
        Ok(self.delete_keys(&keys)?.deleted)
    }

    /// Compacts every key up to main revision `revision`.
    ///
    /// Revisions at or below the last compaction are a no-op. Batches are
    /// submitted independently; a failed batch is logged, the rest still run,
    /// and the first error is returned.
    pub fn kv_compact(&self, revision: i64) -> KvResult<usize> {
        let current = self.current_revision();
        if revision > current {
            return Err(KvError::FutureRevision {
                requested: revision,
                current,
            });
        }
        if revision <= self.reader.compact_revision() {
            debug!(revision, "Compaction at or below previous compact revision, skipped");
            return Ok(0);
        }

        let compact_revision = Revision::new(revision, 0);
        let keys = self.reader.all_keys();
        let mut first_error = None;
        for chunk in keys.chunks(self.config.compaction_batch_size.max(1)) {
            let increments = chunk
                .iter()
                .map(|key| KvIndexIncrement::compaction(key.clone(), compact_revision))
                .collect();
            if let Err(e) = self.submit(increments) {
                error!(error = %e, keys = chunk.len(), revision, "Compaction batch failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(keys = keys.len(), revision, "Compaction finished");
                Ok(keys.len())
            }
        }
    }

    /// Periodic compaction keeping `compaction_retention_rev_count` revisions.
    pub fn compaction_task(&self) -> KvResult<usize> {
        if !self.config.auto_compaction {
            debug!("Compaction task skipped, auto compaction is off");
            return Ok(0);
        }
        let current = self.current_revision();
        if current < self.config.compaction_retention_rev_count {
            debug!(
                current,
                retention = self.config.compaction_retention_rev_count,
                "Compaction task skipped, not enough revisions"
            );
            return Ok(0);
        }
        self.kv_compact(current - self.config.compaction_retention_rev_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ApplyHandler, ApplyOutcome, ConsensusError, ConsensusResult, LocalConsensus};
    use crate::kv::{KvStore, RANGE_END_ALL};
    use crate::storage::backend::MemoryEngine;
    use tokio::sync::mpsc;

    struct KvApplier(Arc<KvStore>);

    impl ApplyHandler for KvApplier {
        fn apply(&self, _index: u64, command: &Command) -> ConsensusResult<ApplyOutcome> {
            match command {
                Command::KvIndex(increments) => {
                    let report = self
                        .0
                        .apply(increments)
                        .map_err(|e| ConsensusError::Kv(Box::new(e)))?;
                    Ok(ApplyOutcome {
                        warnings: report.warnings,
                    })
                }
                Command::Write(_) => Ok(ApplyOutcome::default()),
            }
        }
    }

    fn control(config: KvControlConfig) -> (KvControl, Arc<LeaseManager>) {
        let (tx, _rx) = mpsc::channel(4);
        let leases = Arc::new(LeaseManager::new(tx));
        let engine = MemoryEngine::new();
        let store = Arc::new(KvStore::new(engine.clone(), leases.clone()));
        let consensus = LocalConsensus::open(engine, Arc::new(KvApplier(store.clone()))).unwrap();
        (KvControl::new(config, store.reader(), leases.clone(), consensus), leases)
    }

    #[test]
    fn test_put_validation() {
        let (control, _) = control(KvControlConfig {
            max_key_size: 4,
            max_value_size: 4,
            ..Default::default()
        });

        assert!(matches!(control.kv_put(PutRequest::new("", "v")), Err(KvError::KeyEmpty)));
        assert!(matches!(
            control.kv_put(PutRequest::new("toolong", "v")),
            Err(KvError::KeyTooLong { len: 7, max: 4 })
        ));
        assert!(matches!(control.kv_put(PutRequest::new("k", "")), Err(KvError::ValueEmpty)));
        assert!(matches!(
            control.kv_put(PutRequest::new("k", "12345")),
            Err(KvError::ValueTooLong { .. })
        ));
        assert_eq!(control.current_revision(), 0);
    }

    #[test]
    fn test_put_and_range() {
        let (control, _) = control(KvControlConfig::default());

        assert_eq!(control.kv_put(PutRequest::new("a", "1")).unwrap().revision, 1);
        control.kv_put(PutRequest::new("b", "2")).unwrap();
        control.kv_put(PutRequest::new("c", "3")).unwrap();

        let mut request = PutRequest::new("a", "11");
        request.prev_kv = true;
        let response = control.kv_put(request).unwrap();
        assert_eq!(response.revision, 4);
        assert_eq!(response.prev_kv.unwrap().value, b"1");

        let exact = control.kv_range(b"a", b"", 0, false, false).unwrap();
        assert_eq!(exact.kvs.len(), 1);
        assert_eq!(exact.kvs[0].value, b"11");
        assert_eq!(exact.kvs[0].version, 2);
        assert_eq!(exact.kvs[0].create_revision, 1);

        let page = control.kv_range(b"a", RANGE_END_ALL, 2, true, false).unwrap();
        assert_eq!(page.count, 3);
        assert!(page.more);
        assert_eq!(page.kvs.len(), 2);
        assert!(page.kvs.iter().all(|kv| kv.value.is_empty()));

        let counted = control.kv_range(b"a", b"c", 0, false, true).unwrap();
        assert_eq!(counted.count, 2);
        assert!(counted.kvs.is_empty());

        assert_eq!(control.kv_range_raw_keys(b"b", b"d"), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_ignore_value_and_lease_require_key() {
        let (control, leases) = control(KvControlConfig::default());

        let mut request = PutRequest::new("k", "");
        request.ignore_value = true;
        assert!(matches!(control.kv_put(request.clone()), Err(KvError::KeyNotFound(_))));

        let lease = leases.grant(0, 60).unwrap();
        let mut with_lease = PutRequest::new("k", "v1");
        with_lease.lease = lease.id;
        control.kv_put(with_lease).unwrap();

        // lease carried over, value replaced
        let mut keep_lease = PutRequest::new("k", "v2");
        keep_lease.ignore_lease = true;
        control.kv_put(keep_lease).unwrap();
        let kv = &control.kv_range(b"k", b"", 0, false, false).unwrap().kvs[0];
        assert_eq!(kv.value, b"v2");
        assert_eq!(kv.lease, lease.id);

        // value carried over
        control.kv_put(PutRequest { lease: lease.id, ..request }).unwrap();
        let kv = &control.kv_range(b"k", b"", 0, false, false).unwrap().kvs[0];
        assert_eq!(kv.value, b"v2");

        // switching lease on an existing key is rejected
        assert!(matches!(
            control.kv_put(PutRequest::new("k", "v3")),
            Err(KvError::LeaseMismatch { current, requested: 0 }) if current == lease.id
        ));
    }

    #[test]
    fn test_put_with_unknown_lease() {
        let (control, _) = control(KvControlConfig::default());
        let mut request = PutRequest::new("k", "v");
        request.lease = 1234;
        assert!(matches!(control.kv_put(request), Err(KvError::LeaseNotFound(1234))));
    }

    /// Revokes a lease right before each apply, as a concurrent revoke would.
    struct RevokeBeforeApply {
        store: Arc<KvStore>,
        leases: Arc<LeaseManager>,
        lease: i64,
    }

    impl ApplyHandler for RevokeBeforeApply {
        fn apply(&self, index: u64, command: &Command) -> ConsensusResult<ApplyOutcome> {
            let _ = self.leases.revoke(self.lease);
            KvApplier(self.store.clone()).apply(index, command)
        }
    }

    #[test]
    fn test_rejected_put_releases_revision() {
        let (tx, _rx) = mpsc::channel(4);
        let leases = Arc::new(LeaseManager::new(tx));
        let lease = leases.grant(5, 60).unwrap();
        let engine = MemoryEngine::new();
        let store = Arc::new(KvStore::new(engine.clone(), leases.clone()));
        let handler = RevokeBeforeApply {
            store: store.clone(),
            leases: leases.clone(),
            lease: lease.id,
        };
        let consensus = LocalConsensus::open(engine, Arc::new(handler)).unwrap();
        let control = KvControl::new(KvControlConfig::default(), store.reader(), leases, consensus);

        let mut request = PutRequest::new("k", "v");
        request.lease = lease.id;
        assert!(matches!(control.kv_put(request), Err(KvError::LeaseNotFound(5))));
        assert_eq!(control.current_revision(), 0);
        assert_eq!(store.current_revision(), 0);

        assert_eq!(control.kv_put(PutRequest::new("x", "1")).unwrap().revision, 1);
        assert_eq!(control.kv_put(PutRequest::new("y", "2")).unwrap().revision, 2);
        assert_eq!(store.current_revision(), 2);
    }

    #[test]
    fn test_lease_revoke_races_put() {
        let (control, leases) = control(KvControlConfig::default());
        let control = Arc::new(control);

        for id in 1..=100 {
            leases.grant(id, 60).unwrap();
            let key = format!("k{id}");

            let putter = {
                let control = control.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    let mut request = PutRequest::new(key.as_str(), "v");
                    request.lease = id;
                    match control.kv_put(request) {
                        Ok(_) | Err(KvError::LeaseNotFound(_)) => {}
                        Err(e) => panic!("unexpected put error: {e}"),
                    }
                })
            };
            let revoker = {
                let control = control.clone();
                std::thread::spawn(move || {
                    control.lease_revoke(id).unwrap();
                })
            };
            putter.join().unwrap();
            revoker.join().unwrap();

            assert!(
                control.kv_range_raw_keys(key.as_bytes(), b"").is_empty(),
                "{key} outlived lease {id}"
            );
        }
        assert_eq!(leases.count(), 0);
        assert_eq!(control.current_revision(), control.reader.current_revision());
    }

    #[test]
    fn test_delete_range_assigns_sub_revisions() {
        let (control, _) = control(KvControlConfig::default());
        for key in ["a", "b", "c"] {
            control.kv_put(PutRequest::new(key, "v")).unwrap();
        }

        let response = control.kv_delete_range(b"a", b"c", true).unwrap();
        assert_eq!(response.deleted, 2);
        assert_eq!(response.revision, 4);
        assert_eq!(response.prev_kvs.len(), 2);
        assert_eq!(control.kv_range_raw_keys(b"a", RANGE_END_ALL), vec![b"c".to_vec()]);

        let none = control.kv_delete_range(b"a", b"c", false).unwrap();
        assert_eq!(none.deleted, 0);
        assert_eq!(control.current_revision(), 4);
    }

    #[test]
    fn test_lease_revoke_deletes_keys() {
        let (control, leases) = control(KvControlConfig::default());
        let lease = leases.grant(0, 60).unwrap();
        for key in ["a", "b"] {
            let mut request = PutRequest::new(key, "v");
            request.lease = lease.id;
            control.kv_put(request).unwrap();
        }
        control.kv_put(PutRequest::new("c", "v")).unwrap();

        assert_eq!(control.lease_revoke(lease.id).unwrap(), 2);
        assert_eq!(control.kv_range_raw_keys(b"a", RANGE_END_ALL), vec![b"c".to_vec()]);
        assert!(matches!(control.lease_revoke(lease.id), Err(KvError::LeaseNotFound(_))));
    }

    #[test]
    fn test_compact_keeps_current_values() {
        let (control, _) = control(KvControlConfig::default());
        control.kv_put(PutRequest::new("x", "1")).unwrap();
        control.kv_delete_range(b"x", b"", false).unwrap();
        control.kv_put(PutRequest::new("y", "1")).unwrap();
        control.kv_put(PutRequest::new("y", "2")).unwrap();

        assert!(matches!(control.kv_compact(99), Err(KvError::FutureRevision { .. })));
        assert_eq!(control.kv_compact(4).unwrap(), 2);
        assert_eq!(control.compact_revision(), 4);
        assert_eq!(control.kv_compact(3).unwrap(), 0);

        assert!(control.kv_range(b"x", b"", 0, false, false).unwrap().kvs.is_empty());
        assert_eq!(control.kv_range(b"y", b"", 0, false, false).unwrap().kvs[0].value, b"2");
        assert!(matches!(control.kv_range_at(b"y", b"", 3), Err(KvError::Compacted { .. })));
        assert_eq!(control.kv_range_at(b"y", b"", 0).unwrap()[0].value, b"2");
    }

    #[test]
    fn test_compaction_task_respects_retention() {
        let (control, _) = control(KvControlConfig {
            auto_compaction: true,
            compaction_retention_rev_count: 3,
            compaction_batch_size: 1,
            ..Default::default()
        });
        control.kv_put(PutRequest::new("a", "1")).unwrap();
        control.kv_put(PutRequest::new("a", "2")).unwrap();
        assert_eq!(control.compaction_task().unwrap(), 0);

        control.kv_put(PutRequest::new("a", "3")).unwrap();
        control.kv_put(PutRequest::new("b", "1")).unwrap();
        control.kv_put(PutRequest::new("a", "4")).unwrap();
        assert_eq!(control.compaction_task().unwrap(), 2);
        assert_eq!(control.compact_revision(), 2);

        let (disabled, _) = self::control(KvControlConfig::default());
        assert_eq!(disabled.compaction_task().unwrap(), 0);
    }
}
