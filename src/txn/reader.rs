//! Read side of the transaction engine.
//!
//! Readers take no latch: every lookup goes straight to the raw engine, and
//! a committed value is only reachable once its write record exists.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::backend::{RawEngine, CF_DATA, CF_LOCK, CF_WRITE};
use crate::storage::codec::{decode_key, encode_key, unpackage_value, MAX_TS};
use crate::storage::mvcc::{encoded_range, next_key, version_range, KeyValue, ScanOptions, ScanResult};
use crate::storage::StorageError;
use crate::txn::{IsolationLevel, LockInfo, LockType, TxnResult, TxnResultInfo, WriteInfo, WriteKind};

/// Lock CF key of `key`.
pub fn lock_key(key: &[u8]) -> Vec<u8> {
    encode_key(key, 0)
}

/// Write or data CF key of `key` at `ts`.
pub fn version_key(key: &[u8], ts: i64) -> Vec<u8> {
    encode_key(key, ts)
}

fn read_ts(ts: i64) -> i64 {
    if ts <= 0 {
        MAX_TS
    } else {
        ts
    }
}

/// Whether `lock` blocks a read at `start_ts`.
///
/// Only snapshot reads conflict, and only with locks that may commit at or
/// before `start_ts`: pessimistic and read locks never carry a value, and a
/// lock whose `min_commit_ts` is past `start_ts` will commit after the read.
pub fn check_lock_conflict(
    lock: &LockInfo,
    isolation: IsolationLevel,
    start_ts: i64,
    resolved_locks: &[i64],
) -> bool {
    if isolation == IsolationLevel::ReadCommitted {
        return false;
    }
    if lock.lock_ts > start_ts {
        return false;
    }
    if matches!(lock.lock_type, LockType::Pessimistic | LockType::Lock) {
        return false;
    }
    if lock.min_commit_ts > start_ts {
        return false;
    }
    !resolved_locks.contains(&lock.lock_ts)
}

/// Lock/write/data lookups over a raw engine.
#[derive(Clone)]
pub struct TxnReader {
    engine: Arc<dyn RawEngine>,
}

impl TxnReader {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self { engine }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn RawEngine> {
        &self.engine
    }

    pub fn get_lock(&self, key: &[u8]) -> TxnResult<Option<LockInfo>> {
        match self.engine.get(CF_LOCK, &lock_key(key))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Locks in `[start, end)` with `min_lock_ts <= lock_ts <= max_lock_ts`.
    ///
    /// `max_lock_ts == 0` and `limit == 0` mean unbounded.
    pub fn scan_locks(
        &self,
        min_lock_ts: i64,
        max_lock_ts: i64,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> TxnResult<Vec<LockInfo>> {
        let max_lock_ts = read_ts(max_lock_ts);
        let (lower, upper) = encoded_range(start, end);
        let mut locks = Vec::new();
        for item in self.engine.scan(CF_LOCK, &lower, &upper, false)? {
            let (_, raw) = item?;
            let lock: LockInfo = bincode::deserialize(&raw)?;
            if lock.lock_ts < min_lock_ts || lock.lock_ts > max_lock_ts {
                continue;
            }
            locks.push(lock);
            if limit > 0 && locks.len() >= limit {
                break;
            }
        }
        Ok(locks)
    }

    /// Write records of `key` with `commit_ts <= ts`, newest first.
    pub fn writes<'a>(
        &'a self,
        key: &[u8],
        ts: i64,
    ) -> TxnResult<impl Iterator<Item = TxnResult<(i64, WriteInfo)>> + 'a> {
        let (_, end) = version_range(key);
        let start = version_key(key, read_ts(ts));
        let iter = self.engine.scan(CF_WRITE, &start, &end, false)?;
        Ok(iter.map(|item| -> TxnResult<(i64, WriteInfo)> {
            let (k, v) = item?;
            let (_, commit_ts) = decode_key(&k)?;
            Ok((commit_ts, bincode::deserialize(&v)?))
        }))
    }

    /// Newest write record of `key` at or below `ts`, of any kind.
    pub fn seek_write(&self, key: &[u8], ts: i64) -> TxnResult<Option<(i64, WriteInfo)>> {
        self.writes(key, ts)?.next().transpose()
    }

    /// The commit or rollback record left by the txn that started at
    /// `start_ts`, if any.
    pub fn find_txn_record(&self, key: &[u8], start_ts: i64) -> TxnResult<Option<(i64, WriteInfo)>> {
        for item in self.writes(key, MAX_TS)? {
            let (commit_ts, write) = item?;
            if commit_ts < start_ts {
                break;
            }
            if write.start_ts == start_ts {
                return Ok(Some((commit_ts, write)));
            }
        }
        Ok(None)
    }

    /// Newest write of `key` with `min_commit_ts <= commit_ts <= max_commit_ts`
    /// whose kind is selected by the include flags. A non-zero `start_ts`
    /// only matches records of that txn. Read-lock commits never match.
    #[allow(clippy::too_many_arguments)]
    pub fn get_write_info(
        &self,
        min_commit_ts: i64,
        max_commit_ts: i64,
        start_ts: i64,
        key: &[u8],
        include_rollback: bool,
        include_delete: bool,
        include_put: bool,
    ) -> TxnResult<Option<(WriteInfo, i64)>> {
        for item in self.writes(key, max_commit_ts)? {
            let (commit_ts, write) = item?;
            if commit_ts < min_commit_ts {
                break;
            }
            if start_ts > 0 && write.start_ts != start_ts {
                continue;
            }
            let wanted = match write.kind {
                WriteKind::Put => include_put,
                WriteKind::Delete => include_delete,
                WriteKind::Rollback => include_rollback,
                WriteKind::Lock => false,
            };
            if wanted {
                return Ok(Some((write, commit_ts)));
            }
        }
        Ok(None)
    }

    /// Rollback record of the txn `start_ts` on `key`.
    pub fn get_rollback_info(&self, start_ts: i64, key: &[u8]) -> TxnResult<Option<WriteInfo>> {
        match self.engine.get(CF_WRITE, &version_key(key, start_ts))? {
            Some(raw) => {
                let write: WriteInfo = bincode::deserialize(&raw)?;
                Ok((write.kind == WriteKind::Rollback && write.start_ts == start_ts).then_some(write))
            }
            None => Ok(None),
        }
    }

    /// Committed value of `key` visible at `ts`, ignoring locks.
    pub fn get_value(&self, key: &[u8], ts: i64) -> TxnResult<Option<Vec<u8>>> {
        for item in self.writes(key, ts)? {
            let (commit_ts, write) = item?;
            match write.kind {
                WriteKind::Put => return self.load_value(key, commit_ts, write).map(Some),
                WriteKind::Delete => return Ok(None),
                WriteKind::Rollback | WriteKind::Lock => continue,
            }
        }
        Ok(None)
    }

    fn load_value(&self, key: &[u8], commit_ts: i64, write: WriteInfo) -> TxnResult<Vec<u8>> {
        if let Some(value) = write.short_value {
            return Ok(value);
        }
        let raw = self
            .engine
            .get(CF_DATA, &version_key(key, commit_ts))?
            .ok_or(StorageError::NotFound)?;
        Ok(unpackage_value(&raw)?.payload)
    }

    /// Raw packaged value staged by the prewrite of txn `start_ts`.
    pub fn staged_value(&self, key: &[u8], start_ts: i64) -> TxnResult<Option<Vec<u8>>> {
        Ok(self.engine.get(CF_DATA, &version_key(key, start_ts))?)
    }

    fn read_one(
        &self,
        key: &[u8],
        isolation: IsolationLevel,
        start_ts: i64,
        resolved_locks: &[i64],
        info: &mut TxnResultInfo,
    ) -> TxnResult<Option<Vec<u8>>> {
        if isolation == IsolationLevel::ReadCommitted {
            return self.get_value(key, MAX_TS);
        }
        if let Some(lock) = self.get_lock(key)? {
            if check_lock_conflict(&lock, isolation, start_ts, resolved_locks) {
                info.locked.push(lock);
                return Ok(None);
            }
        }
        self.get_value(key, start_ts)
    }

    /// Point reads of `keys` at `start_ts`. Keys without a visible value are
    /// left out; keys blocked by a lock are reported in the result info.
    pub fn batch_get(
        &self,
        isolation: IsolationLevel,
        start_ts: i64,
        keys: &[Vec<u8>],
        resolved_locks: &[i64],
    ) -> TxnResult<(Vec<KeyValue>, TxnResultInfo)> {
        let mut info = TxnResultInfo::default();
        let mut kvs = Vec::new();
        for key in keys {
            if let Some(value) = self.read_one(key, isolation, start_ts, resolved_locks, &mut info)? {
                kvs.push(KeyValue {
                    key: key.clone(),
                    value,
                });
            }
        }
        Ok((kvs, info))
    }

    /// Range read at `opts.ts`, paginated like [`crate::storage::MvccReader::scan`].
    ///
    /// Keys locked by a conflicting txn are skipped and reported; only locks
    /// inside the part of the range this page covered are reported.
    pub fn scan(
        &self,
        isolation: IsolationLevel,
        opts: &ScanOptions,
        resolved_locks: &[i64],
    ) -> TxnResult<(ScanResult, TxnResultInfo)> {
        let ts = match isolation {
            IsolationLevel::SnapshotIsolation => read_ts(opts.ts),
            IsolationLevel::ReadCommitted => MAX_TS,
        };

        let mut blocked: BTreeMap<Vec<u8>, LockInfo> = BTreeMap::new();
        if isolation == IsolationLevel::SnapshotIsolation {
            for lock in self.scan_locks(0, 0, &opts.start, &opts.end, 0)? {
                if check_lock_conflict(&lock, isolation, ts, resolved_locks) {
                    blocked.insert(lock.key.clone(), lock);
                }
            }
        }

        let (lower, upper) = encoded_range(&opts.start, &opts.end);
        let mut result = ScanResult::default();
        let mut previous: Option<Vec<u8>> = None;
        for item in self.engine.scan(CF_WRITE, &lower, &upper, opts.reverse)? {
            let (k, _) = item?;
            let (user_key, _) = decode_key(&k)?;
            if previous.as_deref() == Some(user_key.as_slice()) {
                continue;
            }
            previous = Some(user_key.clone());
            if blocked.contains_key(&user_key) {
                continue;
            }

            let Some(value) = self.get_value(&user_key, ts)? else {
                continue;
            };
            if opts.limit > 0 && result.kvs.len() >= opts.limit {
                result.has_more = true;
                result.end_key = if opts.reverse { next_key(&user_key) } else { user_key };
                break;
            }
            result.kvs.push(KeyValue {
                key: user_key,
                value: if opts.keys_only { Vec::new() } else { value },
            });
        }

        if result.has_more {
            let cursor = result.end_key.clone();
            blocked.retain(|key, _| if opts.reverse { *key >= cursor } else { *key < cursor });
        }
        let mut info = TxnResultInfo::default();
        info.locked.extend(blocked.into_values());
        if opts.reverse {
            info.locked.reverse();
        }
        Ok((result, info))
    }
}
