//! Write side of the transaction engine.
//!
//! Every operation reads the current lock/write state, stages its changes
//! into one [`WriteBatch`] and submits it through consensus. The check and
//! the submit happen under one latch so no other txn write can slip between
//! them.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::consensus::{Command, ConsensusEngine};
use crate::storage::backend::{RawEngine, WriteBatch, CF_DATA, CF_LOCK, CF_WRITE};
use crate::storage::codec::MAX_TS;
use crate::storage::mvcc::{KeyValue, MvccWriter, ScanOptions, ScanResult};
use crate::tso::{physical_ms, TimestampOracle};
use crate::txn::reader::{lock_key, version_key, TxnReader};
use crate::txn::{
    IsolationLevel, LockInfo, LockType, Mutation, MutationOp, TxnError, TxnResult, TxnResultInfo, TxnStatus,
    WriteInfo, WriteKind, SHORT_VALUE_MAX_LEN,
};

/// Arguments of [`TxnEngine::prewrite`].
#[derive(Clone, Debug, Default)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub primary_lock: Vec<u8>,
    pub start_ts: i64,
    pub lock_ttl: i64,
    pub txn_size: i64,
    /// Commit in one phase when a commit ts within `max_commit_ts` is available.
    pub try_one_pc: bool,
    /// Upper bound for a one-phase commit ts; 0 means unbounded.
    pub max_commit_ts: i64,
    /// Per mutation: whether the key must already hold this txn's pessimistic
    /// lock. Empty means no key does.
    pub pessimistic_checks: Vec<bool>,
    /// Mutation index -> required `for_update_ts` of its pessimistic lock.
    pub for_update_ts_checks: BTreeMap<usize, i64>,
    /// Mutation index -> opaque data stored on the lock.
    pub lock_extra_datas: BTreeMap<usize, Vec<u8>>,
}

impl PrewriteRequest {
    pub fn new(mutations: Vec<Mutation>, primary_lock: impl Into<Vec<u8>>, start_ts: i64, lock_ttl: i64) -> Self {
        let txn_size = mutations.len() as i64;
        Self {
            mutations,
            primary_lock: primary_lock.into(),
            start_ts,
            lock_ttl,
            txn_size,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrewriteResponse {
    /// Commit ts when the txn was committed in one phase, otherwise 0.
    pub one_pc_commit_ts: i64,
}

/// A lock that passed every prewrite check, with its value when too large
/// to inline.
struct PreparedLock {
    lock: LockInfo,
    large_value: Option<Vec<u8>>,
}

enum OwnRecord {
    Committed,
    RolledBack,
}

pub struct TxnEngine {
    reader: TxnReader,
    consensus: Arc<dyn ConsensusEngine>,
    tso: Arc<dyn TimestampOracle>,
    write_latch: Mutex<()>,
}

fn write_kind(lock_type: LockType) -> WriteKind {
    match lock_type {
        LockType::Put => WriteKind::Put,
        LockType::Delete => WriteKind::Delete,
        LockType::Lock | LockType::Pessimistic => WriteKind::Lock,
    }
}

fn stage_lock(batch: &mut WriteBatch, lock: &LockInfo) -> TxnResult<()> {
    batch.put(CF_LOCK, lock_key(&lock.key), bincode::serialize(lock)?);
    Ok(())
}

fn stage_write(batch: &mut WriteBatch, key: &[u8], write: &WriteInfo) -> TxnResult<()> {
    batch.put(CF_WRITE, version_key(key, write.commit_ts), bincode::serialize(write)?);
    Ok(())
}

fn check_keys(keys: &[Vec<u8>]) -> TxnResult<()> {
    if keys.is_empty() {
        return Err(TxnError::InvalidArgument("keys are empty".to_string()));
    }
    if keys.iter().any(|k| k.is_empty()) {
        return Err(TxnError::InvalidArgument("key is empty".to_string()));
    }
    Ok(())
}

fn check_ts(name: &str, ts: i64) -> TxnResult<()> {
    if ts <= 0 {
        return Err(TxnError::InvalidArgument(format!("{} must be positive, got {}", name, ts)));
    }
    Ok(())
}

impl TxnEngine {
    pub fn new(
        engine: Arc<dyn RawEngine>,
        consensus: Arc<dyn ConsensusEngine>,
        tso: Arc<dyn TimestampOracle>,
    ) -> Self {
        Self {
            reader: TxnReader::new(engine),
            consensus,
            tso,
            write_latch: Mutex::new(()),
        }
    }

    pub fn reader(&self) -> &TxnReader {
        &self.reader
    }

    fn submit(&self, batch: WriteBatch) -> TxnResult<()> {
        if !batch.is_empty() {
            self.consensus.submit_sync(Command::Write(batch))?;
        }
        Ok(())
    }

    fn own_record(&self, key: &[u8], start_ts: i64) -> TxnResult<Option<(i64, OwnRecord)>> {
        Ok(self.reader.find_txn_record(key, start_ts)?.map(|(commit_ts, write)| {
            let state = if write.kind == WriteKind::Rollback {
                OwnRecord::RolledBack
            } else {
                OwnRecord::Committed
            };
            (commit_ts, state)
        }))
    }

    /// First-committer-wins: any data or lock commit after `ts` by another txn
    /// conflicts. Returns the txn's own record instead when it has one.
    fn check_write_conflict(&self, key: &[u8], start_ts: i64, ts: i64) -> TxnResult<Option<OwnRecord>> {
        let mut conflict = None;
        for item in self.reader.writes(key, MAX_TS)? {
            let (commit_ts, write) = item?;
            if commit_ts < start_ts {
                break;
            }
            if write.start_ts == start_ts {
                return Ok(Some(if write.kind == WriteKind::Rollback {
                    OwnRecord::RolledBack
                } else {
                    OwnRecord::Committed
                }));
            }
            if conflict.is_none() && commit_ts > ts && write.kind != WriteKind::Rollback {
                conflict = Some((write.start_ts, commit_ts));
            }
        }
        match conflict {
            Some((conflict_start_ts, conflict_commit_ts)) => Err(TxnError::WriteConflict {
                key: key.to_vec(),
                start_ts,
                conflict_start_ts,
                conflict_commit_ts,
            }),
            None => Ok(None),
        }
    }

    // ---- reads ----

    pub fn get_lock_info(&self, key: &[u8]) -> TxnResult<Option<LockInfo>> {
        self.reader.get_lock(key)
    }

    pub fn scan_lock(
        &self,
        min_lock_ts: i64,
        max_lock_ts: i64,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> TxnResult<Vec<LockInfo>> {
        self.reader.scan_locks(min_lock_ts, max_lock_ts, start, end, limit)
    }

    pub fn batch_get(
        &self,
        isolation: IsolationLevel,
        start_ts: i64,
        keys: &[Vec<u8>],
        resolved_locks: &[i64],
    ) -> TxnResult<(Vec<KeyValue>, TxnResultInfo)> {
        check_keys(keys)?;
        if isolation == IsolationLevel::SnapshotIsolation {
            check_ts("start_ts", start_ts)?;
        }
        self.reader.batch_get(isolation, start_ts, keys, resolved_locks)
    }

    /// Snapshot scan; `opts.ts` is the reader's `start_ts`.
    pub fn scan(
        &self,
        isolation: IsolationLevel,
        opts: &ScanOptions,
        resolved_locks: &[i64],
    ) -> TxnResult<(ScanResult, TxnResultInfo)> {
        if !opts.end.is_empty() && opts.start >= opts.end {
            return Err(TxnError::InvalidArgument("scan start must be below end".to_string()));
        }
        if isolation == IsolationLevel::SnapshotIsolation {
            check_ts("start_ts", opts.ts)?;
        }
        self.reader.scan(isolation, opts, resolved_locks)
    }

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
        self.reader.get_write_info(
            min_commit_ts,
            max_commit_ts,
            start_ts,
            key,
            include_rollback,
            include_delete,
            include_put,
        )
    }

    pub fn get_rollback_info(&self, start_ts: i64, key: &[u8]) -> TxnResult<Option<WriteInfo>> {
        self.reader.get_rollback_info(start_ts, key)
    }

    // ---- pessimistic locks ----

    /// Takes pessimistic locks on every mutation's key.
    ///
    /// A key already locked by this txn has its lock renewed. A key committed
    /// by another txn after `for_update_ts` is a write conflict.
    pub fn pessimistic_lock(
        &self,
        mutations: &[Mutation],
        primary_lock: &[u8],
        start_ts: i64,
        lock_ttl: i64,
        for_update_ts: i64,
    ) -> TxnResult<()> {
        if mutations.is_empty() || primary_lock.is_empty() {
            return Err(TxnError::InvalidArgument("mutations and primary lock are required".to_string()));
        }
        check_ts("start_ts", start_ts)?;
        check_ts("for_update_ts", for_update_ts)?;

        let _guard = self.write_latch.lock();
        let mut batch = WriteBatch::new();
        for mutation in mutations {
            let key = &mutation.key;
            if key.is_empty() {
                return Err(TxnError::InvalidArgument("key is empty".to_string()));
            }

            if let Some(mut lock) = self.reader.get_lock(key)? {
                if lock.lock_ts != start_ts {
                    return Err(TxnError::KeyIsLocked {
                        key: key.clone(),
                        lock: Box::new(lock),
                    });
                }
                if lock.is_pessimistic() {
                    lock.for_update_ts = lock.for_update_ts.max(for_update_ts);
                    lock.lock_ttl = lock.lock_ttl.max(lock_ttl);
                    stage_lock(&mut batch, &lock)?;
                }
                continue;
            }

            match self.check_write_conflict(key, start_ts, for_update_ts)? {
                Some(OwnRecord::RolledBack) => {
                    return Err(TxnError::TxnRolledBack {
                        key: key.clone(),
                        start_ts,
                    })
                }
                Some(OwnRecord::Committed) => continue,
                None => {}
            }

            let lock = LockInfo {
                key: key.clone(),
                primary_lock: primary_lock.to_vec(),
                lock_ts: start_ts,
                for_update_ts,
                lock_ttl,
                txn_size: mutations.len() as i64,
                lock_type: LockType::Pessimistic,
                short_value: None,
                extra_data: Vec::new(),
                min_commit_ts: 0,
            };
            stage_lock(&mut batch, &lock)?;
        }

        self.submit(batch)?;
        debug!(start_ts, for_update_ts, keys = mutations.len(), "Pessimistic locks acquired");
        Ok(())
    }

    /// Releases pessimistic locks of `start_ts` taken at or before
    /// `for_update_ts`. Other keys are left alone.
    pub fn pessimistic_rollback(&self, keys: &[Vec<u8>], start_ts: i64, for_update_ts: i64) -> TxnResult<usize> {
        check_keys(keys)?;
        check_ts("start_ts", start_ts)?;

        let _guard = self.write_latch.lock();
        let mut batch = WriteBatch::new();
        for key in keys {
            if let Some(lock) = self.reader.get_lock(key)? {
                if lock.lock_ts == start_ts && lock.is_pessimistic() && lock.for_update_ts <= for_update_ts {
                    batch.delete(CF_LOCK, lock_key(key));
                }
            }
        }
        let released = batch.len();
        self.submit(batch)?;
        debug!(start_ts, for_update_ts, released, "Pessimistic locks rolled back");
        Ok(released)
    }

    // ---- two-phase commit ----

    fn prepare_mutation(&self, req: &PrewriteRequest, index: usize) -> TxnResult<Option<PreparedLock>> {
        let mutation = &req.mutations[index];
        let key = &mutation.key;
        let start_ts = req.start_ts;
        let pessimistic = req.pessimistic_checks.get(index).copied().unwrap_or(false);

        let mut for_update_ts = 0;
        match self.reader.get_lock(key)? {
            Some(lock) if lock.lock_ts != start_ts => {
                return Err(TxnError::KeyIsLocked {
                    key: key.clone(),
                    lock: Box::new(lock),
                });
            }
            Some(lock) if lock.is_pessimistic() => {
                if let Some(expected) = req.for_update_ts_checks.get(&index) {
                    if lock.for_update_ts != *expected {
                        return Err(TxnError::PessimisticLockNotFound {
                            key: key.clone(),
                            start_ts,
                        });
                    }
                }
                for_update_ts = lock.for_update_ts;
            }
            // Already prewritten by this txn.
            Some(_) => return Ok(None),
            None if pessimistic => {
                return match self.own_record(key, start_ts)? {
                    Some((_, OwnRecord::Committed)) => Ok(None),
                    Some((_, OwnRecord::RolledBack)) => Err(TxnError::TxnRolledBack {
                        key: key.clone(),
                        start_ts,
                    }),
                    None => Err(TxnError::PessimisticLockNotFound {
                        key: key.clone(),
                        start_ts,
                    }),
                };
            }
            None => match self.check_write_conflict(key, start_ts, start_ts)? {
                Some(OwnRecord::RolledBack) => {
                    return Err(TxnError::TxnRolledBack {
                        key: key.clone(),
                        start_ts,
                    })
                }
                Some(OwnRecord::Committed) => return Ok(None),
                None => {}
            },
        }

        if matches!(mutation.op, MutationOp::PutIfAbsent | MutationOp::CheckNotExists)
            && self.reader.get_value(key, MAX_TS)?.is_some()
        {
            return Err(TxnError::KeyAlreadyExists { key: key.clone() });
        }

        let (lock_type, value) = match mutation.op {
            MutationOp::Put | MutationOp::PutIfAbsent => (LockType::Put, Some(mutation.value.clone())),
            MutationOp::Delete => (LockType::Delete, None),
            MutationOp::Lock => (LockType::Lock, None),
            MutationOp::CheckNotExists => return Ok(None),
        };
        let (short_value, large_value) = match value {
            Some(v) if v.len() <= SHORT_VALUE_MAX_LEN => (Some(v), None),
            Some(v) => (None, Some(v)),
            None => (None, None),
        };

        Ok(Some(PreparedLock {
            lock: LockInfo {
                key: key.clone(),
                primary_lock: req.primary_lock.clone(),
                lock_ts: start_ts,
                for_update_ts,
                lock_ttl: req.lock_ttl,
                txn_size: req.txn_size,
                lock_type,
                short_value,
                extra_data: req.lock_extra_datas.get(&index).cloned().unwrap_or_default(),
                min_commit_ts: 0,
            },
            large_value,
        }))
    }

    /// A one-phase commit ts, or `None` to fall back to two phases.
    fn one_pc_commit_ts(&self, req: &PrewriteRequest) -> Option<i64> {
        if !req.try_one_pc {
            return None;
        }
        let ts = self.tso.get_ts();
        if ts == 0 {
            debug!(start_ts = req.start_ts, "TSO unavailable, falling back to two-phase commit");
            return None;
        }
        if ts <= req.start_ts || (req.max_commit_ts > 0 && ts > req.max_commit_ts) {
            debug!(
                start_ts = req.start_ts,
                commit_ts = ts,
                max_commit_ts = req.max_commit_ts,
                "One-phase commit ts out of bounds, falling back to two-phase commit"
            );
            return None;
        }
        Some(ts)
    }

    /// Phase one: locks every key and stages its value.
    pub fn prewrite(&self, req: &PrewriteRequest) -> TxnResult<PrewriteResponse> {
        if req.mutations.is_empty() || req.primary_lock.is_empty() {
            return Err(TxnError::InvalidArgument("mutations and primary lock are required".to_string()));
        }
        check_ts("start_ts", req.start_ts)?;
        if !req.pessimistic_checks.is_empty() && req.pessimistic_checks.len() != req.mutations.len() {
            return Err(TxnError::InvalidArgument(format!(
                "{} pessimistic checks for {} mutations",
                req.pessimistic_checks.len(),
                req.mutations.len()
            )));
        }
        if req.mutations.iter().any(|m| m.key.is_empty()) {
            return Err(TxnError::InvalidArgument("key is empty".to_string()));
        }

        let _guard = self.write_latch.lock();
        let mut prepared = Vec::with_capacity(req.mutations.len());
        for index in 0..req.mutations.len() {
            if let Some(lock) = self.prepare_mutation(req, index)? {
                prepared.push(lock);
            }
        }

        let mut batch = WriteBatch::new();
        let mut response = PrewriteResponse::default();
        match self.one_pc_commit_ts(req) {
            Some(commit_ts) => {
                for PreparedLock { lock, large_value } in prepared {
                    if let Some(value) = large_value {
                        MvccWriter::put(&mut batch, CF_DATA, &lock.key, commit_ts, &value);
                    }
                    // drops a pessimistic lock held by this txn
                    batch.delete(CF_LOCK, lock_key(&lock.key));
                    let write = WriteInfo {
                        start_ts: req.start_ts,
                        commit_ts,
                        kind: write_kind(lock.lock_type),
                        short_value: lock.short_value,
                    };
                    stage_write(&mut batch, &lock.key, &write)?;
                }
                response.one_pc_commit_ts = commit_ts;
            }
            None => {
                for PreparedLock { lock, large_value } in prepared {
                    if let Some(value) = large_value {
                        MvccWriter::put(&mut batch, CF_DATA, &lock.key, req.start_ts, &value);
                    }
                    stage_lock(&mut batch, &lock)?;
                }
            }
        }

        self.submit(batch)?;
        debug!(
            start_ts = req.start_ts,
            keys = req.mutations.len(),
            one_pc_commit_ts = response.one_pc_commit_ts,
            "Prewrite finished"
        );
        Ok(response)
    }

    /// Turns `lock` into a write record at `commit_ts`.
    fn stage_commit(&self, batch: &mut WriteBatch, lock: &LockInfo, commit_ts: i64) -> TxnResult<()> {
        let kind = write_kind(lock.lock_type);
        if kind == WriteKind::Put && lock.short_value.is_none() {
            let staged = self
                .reader
                .staged_value(&lock.key, lock.lock_ts)?
                .ok_or_else(|| TxnError::TxnNotFound {
                    key: lock.key.clone(),
                    start_ts: lock.lock_ts,
                })?;
            batch.put(CF_DATA, version_key(&lock.key, commit_ts), staged);
            batch.delete(CF_DATA, version_key(&lock.key, lock.lock_ts));
        }
        batch.delete(CF_LOCK, lock_key(&lock.key));
        let write = WriteInfo {
            start_ts: lock.lock_ts,
            commit_ts,
            kind,
            short_value: lock.short_value.clone(),
        };
        stage_write(batch, &lock.key, &write)
    }

    /// Removes this txn's lock, if present, and fences `start_ts` with a
    /// rollback record.
    fn stage_rollback(
        &self,
        batch: &mut WriteBatch,
        key: &[u8],
        start_ts: i64,
        lock: Option<&LockInfo>,
    ) -> TxnResult<()> {
        if let Some(lock) = lock {
            batch.delete(CF_LOCK, lock_key(key));
            if lock.lock_type == LockType::Put && lock.short_value.is_none() {
                batch.delete(CF_DATA, version_key(key, start_ts));
            }
        }
        // Another txn committed at exactly start_ts; its record must survive.
        if let Some((commit_ts, write)) = self.reader.seek_write(key, start_ts)? {
            if commit_ts == start_ts && write.start_ts != start_ts {
                debug!(start_ts, "Commit record occupies rollback slot, skipping rollback record");
                return Ok(());
            }
        }
        let rollback = WriteInfo {
            start_ts,
            commit_ts: start_ts,
            kind: WriteKind::Rollback,
            short_value: None,
        };
        stage_write(batch, key, &rollback)
    }

    /// Phase two. All-or-nothing: every key is checked before anything is
    /// staged. Keys already committed by this txn are skipped.
    pub fn commit(&self, keys: &[Vec<u8>], start_ts: i64, commit_ts: i64) -> TxnResult<()> {
        check_keys(keys)?;
        check_ts("start_ts", start_ts)?;
        if commit_ts <= start_ts {
            return Err(TxnError::InvalidArgument(format!(
                "commit_ts {} must exceed start_ts {}",
                commit_ts, start_ts
            )));
        }

        let _guard = self.write_latch.lock();
        let mut to_commit = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.reader.get_lock(key)?;
            match lock {
                Some(lock) if lock.lock_ts == start_ts && !lock.is_pessimistic() => {
                    if commit_ts < lock.min_commit_ts {
                        return Err(TxnError::CommitTsExpired {
                            key: key.clone(),
                            commit_ts,
                            min_commit_ts: lock.min_commit_ts,
                        });
                    }
                    to_commit.push(lock);
                }
                lock => match self.own_record(key, start_ts)? {
                    Some((_, OwnRecord::Committed)) => continue,
                    Some((_, OwnRecord::RolledBack)) => {
                        return Err(TxnError::TxnRolledBack {
                            key: key.clone(),
                            start_ts,
                        })
                    }
                    None => {
                        return Err(match lock {
                            Some(lock) => TxnError::TxnLockNotMatch {
                                key: key.clone(),
                                start_ts,
                                lock_ts: lock.lock_ts,
                            },
                            None => TxnError::TxnNotFound {
                                key: key.clone(),
                                start_ts,
                            },
                        })
                    }
                },
            }
        }

        let mut batch = WriteBatch::new();
        for lock in &to_commit {
            self.stage_commit(&mut batch, lock, commit_ts)?;
        }
        self.submit(batch)?;
        debug!(start_ts, commit_ts, committed = to_commit.len(), "Commit finished");
        Ok(())
    }

    /// Rolls back `start_ts` on every key. Fails without writing anything if
    /// any key was already committed by this txn.
    pub fn batch_rollback(&self, keys: &[Vec<u8>], start_ts: i64) -> TxnResult<()> {
        check_keys(keys)?;
        check_ts("start_ts", start_ts)?;

        let _guard = self.write_latch.lock();
        let mut batch = WriteBatch::new();
        for key in keys {
            match self.own_record(key, start_ts)? {
                Some((commit_ts, OwnRecord::Committed)) => {
                    return Err(TxnError::AlreadyCommitted {
                        key: key.clone(),
                        start_ts,
                        commit_ts,
                    })
                }
                Some((_, OwnRecord::RolledBack)) => continue,
                None => {}
            }
            let lock = self.reader.get_lock(key)?.filter(|l| l.lock_ts == start_ts);
            self.stage_rollback(&mut batch, key, start_ts, lock.as_ref())?;
        }
        self.submit(batch)?;
        debug!(start_ts, keys = keys.len(), "Rollback finished");
        Ok(())
    }

    /// Decides the fate of the txn owning `primary_key`.
    ///
    /// A live lock whose TTL (milliseconds of physical time since `lock_ts`)
    /// ran out by `current_ts` is rolled back. A live lock otherwise gets its
    /// `min_commit_ts` pushed past `caller_start_ts` so the caller's snapshot
    /// read need not wait for it.
    pub fn check_txn_status(
        &self,
        primary_key: &[u8],
        lock_ts: i64,
        caller_start_ts: i64,
        current_ts: i64,
    ) -> TxnResult<TxnStatus> {
        if primary_key.is_empty() {
            return Err(TxnError::InvalidArgument("primary key is empty".to_string()));
        }
        check_ts("lock_ts", lock_ts)?;

        let _guard = self.write_latch.lock();
        let mut batch = WriteBatch::new();
        let status = match self.reader.get_lock(primary_key)? {
            Some(mut lock) if lock.lock_ts == lock_ts => {
                if physical_ms(current_ts) - physical_ms(lock_ts) > lock.lock_ttl {
                    self.stage_rollback(&mut batch, primary_key, lock_ts, Some(&lock))?;
                    info!(lock_ts, lock_ttl = lock.lock_ttl, "Expired txn rolled back");
                    TxnStatus::TtlExpireRollback
                } else {
                    if !lock.is_pessimistic() && caller_start_ts > 0 && lock.min_commit_ts <= caller_start_ts {
                        lock.min_commit_ts = caller_start_ts + 1;
                        stage_lock(&mut batch, &lock)?;
                    }
                    TxnStatus::Locked {
                        lock_ttl: lock.lock_ttl,
                        min_commit_ts: lock.min_commit_ts,
                    }
                }
            }
            _ => match self.own_record(primary_key, lock_ts)? {
                Some((commit_ts, OwnRecord::Committed)) => TxnStatus::Committed { commit_ts },
                Some((_, OwnRecord::RolledBack)) => TxnStatus::RolledBack,
                None => {
                    self.stage_rollback(&mut batch, primary_key, lock_ts, None)?;
                    TxnStatus::LockNotExistRollback
                }
            },
        };
        self.submit(batch)?;
        Ok(status)
    }

    /// Commits (`commit_ts > 0`) or rolls back (`commit_ts == 0`) every lock
    /// of `start_ts` on `keys`, or on the whole lock CF when `keys` is empty.
    /// Pessimistic locks carry no prewritten data and are always rolled back.
    /// A `commit_ts` below any lock's `min_commit_ts` fails before anything is
    /// staged. Returns the number of locks resolved.
    pub fn resolve_lock(&self, start_ts: i64, commit_ts: i64, keys: &[Vec<u8>]) -> TxnResult<usize> {
        check_ts("start_ts", start_ts)?;
        if commit_ts != 0 && commit_ts <= start_ts {
            return Err(TxnError::InvalidArgument(format!(
                "commit_ts {} must exceed start_ts {}",
                commit_ts, start_ts
            )));
        }

        let _guard = self.write_latch.lock();
        let locks = if keys.is_empty() {
            self.reader.scan_locks(start_ts, start_ts, &[], &[], 0)?
        } else {
            let mut locks = Vec::new();
            for key in keys {
                if let Some(lock) = self.reader.get_lock(key)?.filter(|l| l.lock_ts == start_ts) {
                    locks.push(lock);
                }
            }
            locks
        };

        if commit_ts > 0 {
            if let Some(lock) = locks
                .iter()
                .find(|lock| !lock.is_pessimistic() && commit_ts < lock.min_commit_ts)
            {
                return Err(TxnError::CommitTsExpired {
                    key: lock.key.clone(),
                    commit_ts,
                    min_commit_ts: lock.min_commit_ts,
                });
            }
        }

        let mut batch = WriteBatch::new();
        for lock in &locks {
            if commit_ts > 0 && !lock.is_pessimistic() {
                self.stage_commit(&mut batch, lock, commit_ts)?;
            } else {
                self.stage_rollback(&mut batch, &lock.key, start_ts, Some(lock))?;
            }
        }
        self.submit(batch)?;
        info!(start_ts, commit_ts, resolved = locks.len(), "Locks resolved");
        Ok(locks.len())
    }

    /// Raises the primary lock's TTL to `advise_lock_ttl`; never lowers it.
    /// Returns the TTL now in effect.
    pub fn heart_beat(&self, primary_lock: &[u8], start_ts: i64, advise_lock_ttl: i64) -> TxnResult<i64> {
        check_ts("start_ts", start_ts)?;

        let _guard = self.write_latch.lock();
        let mut lock = match self.reader.get_lock(primary_lock)? {
            Some(lock) if lock.lock_ts == start_ts => lock,
            _ => {
                return Err(TxnError::TxnNotFound {
                    key: primary_lock.to_vec(),
                    start_ts,
                })
            }
        };
        if advise_lock_ttl > lock.lock_ttl {
            lock.lock_ttl = advise_lock_ttl;
            let mut batch = WriteBatch::new();
            stage_lock(&mut batch, &lock)?;
            self.submit(batch)?;
        }
        Ok(lock.lock_ttl)
    }

    /// Physically removes every lock, write record and value in `[start, end)`.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> TxnResult<()> {
        if end.is_empty() || start >= end {
            return Err(TxnError::InvalidArgument("delete range start must be below end".to_string()));
        }

        let _guard = self.write_latch.lock();
        let mut batch = WriteBatch::new();
        for cf in [CF_LOCK, CF_WRITE, CF_DATA] {
            MvccWriter::delete_range(&mut batch, cf, start, end);
        }
        self.submit(batch)?;
        warn!(start = ?start, end = ?end, "Txn range deleted");
        Ok(())
    }

    pub(crate) fn latch(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_latch.lock()
    }

    pub(crate) fn submit_batch(&self, batch: WriteBatch) -> TxnResult<()> {
        self.submit(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ApplyHandler, ApplyOutcome, ConsensusResult, LocalConsensus};
    use crate::storage::backend::MemoryEngine;
    use crate::tso::{compose_ts, ManualTso};

    struct WriteApplier(Arc<dyn RawEngine>);

    impl ApplyHandler for WriteApplier {
        fn apply(&self, _index: u64, command: &Command) -> ConsensusResult<ApplyOutcome> {
            if let Command::Write(batch) = command {
                self.0.write(batch.clone())?;
            }
            Ok(ApplyOutcome::default())
        }
    }

    fn setup() -> (TxnEngine, Arc<ManualTso>) {
        let engine: Arc<dyn RawEngine> = MemoryEngine::new();
        let consensus = LocalConsensus::open(engine.clone(), Arc::new(WriteApplier(engine.clone()))).unwrap();
        let tso = Arc::new(ManualTso::new(100));
        (TxnEngine::new(engine, consensus, tso.clone()), tso)
    }

    fn keys(names: &[&[u8]]) -> Vec<Vec<u8>> {
        names.iter().map(|k| k.to_vec()).collect()
    }

    fn prewrite_put(engine: &TxnEngine, key: &[u8], value: &[u8], start_ts: i64) -> TxnResult<PrewriteResponse> {
        engine.prewrite(&PrewriteRequest::new(vec![Mutation::put(key, value)], key, start_ts, 3000))
    }

    fn read(engine: &TxnEngine, key: &[u8], ts: i64) -> Option<Vec<u8>> {
        engine.reader().get_value(key, ts).unwrap()
    }

    #[test]
    fn test_pessimistic_lock_lifecycle() {
        let (engine, _) = setup();
        let k1 = vec![Mutation::with_op(MutationOp::Lock, b"k1".to_vec(), Vec::new())];

        engine.pessimistic_lock(&k1, b"k1", 5, 3000, 5).unwrap();
        let err = engine.pessimistic_lock(&k1, b"k1", 6, 3000, 6).unwrap_err();
        assert!(matches!(err, TxnError::KeyIsLocked { ref lock, .. } if lock.lock_ts == 5));

        // re-entry renews
        engine.pessimistic_lock(&k1, b"k1", 5, 5000, 7).unwrap();
        let lock = engine.get_lock_info(b"k1").unwrap().unwrap();
        assert_eq!((lock.for_update_ts, lock.lock_ttl), (7, 5000));

        // too old a for_update_ts leaves the lock in place
        assert_eq!(engine.pessimistic_rollback(&keys(&[b"k1"]), 5, 6).unwrap(), 0);
        assert_eq!(engine.pessimistic_rollback(&keys(&[b"k1"]), 5, 7).unwrap(), 1);
        assert!(engine.get_lock_info(b"k1").unwrap().is_none());

        engine.pessimistic_lock(&k1, b"k1", 7, 3000, 7).unwrap();
    }

    #[test]
    fn test_pessimistic_lock_write_conflict() {
        let (engine, _) = setup();
        prewrite_put(&engine, b"k", b"v", 5).unwrap();
        engine.commit(&keys(&[b"k"]), 5, 8).unwrap();

        let lock = vec![Mutation::put(b"k".to_vec(), b"x".to_vec())];
        let err = engine.pessimistic_lock(&lock, b"k", 6, 3000, 7).unwrap_err();
        assert!(matches!(err, TxnError::WriteConflict { conflict_commit_ts: 8, .. }));
        engine.pessimistic_lock(&lock, b"k", 6, 3000, 9).unwrap();
    }

    #[test]
    fn test_prewrite_commit_and_write_conflict() {
        let (engine, _) = setup();
        prewrite_put(&engine, b"k1", b"v1", 5).unwrap();

        // mutual exclusion while the lock is held
        assert!(matches!(
            prewrite_put(&engine, b"k1", b"other", 6),
            Err(TxnError::KeyIsLocked { .. })
        ));

        engine.commit(&keys(&[b"k1"]), 5, 8).unwrap();
        assert!(engine.get_lock_info(b"k1").unwrap().is_none());
        assert_eq!(read(&engine, b"k1", 8), Some(b"v1".to_vec()));
        assert_eq!(read(&engine, b"k1", 7), None);

        let err = prewrite_put(&engine, b"k1", b"late", 6).unwrap_err();
        assert!(matches!(
            err,
            TxnError::WriteConflict {
                start_ts: 6,
                conflict_start_ts: 5,
                conflict_commit_ts: 8,
                ..
            }
        ));
        assert!(err.is_conflict());

        // a commit at exactly start_ts does not conflict
        prewrite_put(&engine, b"k1", b"next", 8).unwrap();
    }

    #[test]
    fn test_large_value_staged_then_materialized() {
        let (engine, _) = setup();
        let big = vec![7u8; SHORT_VALUE_MAX_LEN + 1];
        prewrite_put(&engine, b"big", &big, 10).unwrap();

        let lock = engine.get_lock_info(b"big").unwrap().unwrap();
        assert!(lock.short_value.is_none());
        assert!(engine.reader().staged_value(b"big", 10).unwrap().is_some());
        assert_eq!(read(&engine, b"big", 0), None);

        engine.commit(&keys(&[b"big"]), 10, 11).unwrap();
        assert!(engine.reader().staged_value(b"big", 10).unwrap().is_none());
        assert_eq!(read(&engine, b"big", 11), Some(big));
    }

    #[test]
    fn test_commit_all_or_nothing_and_idempotent() {
        let (engine, _) = setup();
        prewrite_put(&engine, b"a", b"1", 5).unwrap();

        let err = engine.commit(&keys(&[b"a", b"missing"]), 5, 6).unwrap_err();
        assert!(matches!(err, TxnError::TxnNotFound { .. }));
        assert!(err.is_not_found());
        assert!(engine.get_lock_info(b"a").unwrap().is_some());

        engine.commit(&keys(&[b"a"]), 5, 6).unwrap();
        engine.commit(&keys(&[b"a"]), 5, 6).unwrap();

        prewrite_put(&engine, b"b", b"1", 10).unwrap();
        assert!(matches!(
            engine.commit(&keys(&[b"b"]), 9, 12),
            Err(TxnError::TxnLockNotMatch { lock_ts: 10, .. })
        ));
        assert!(matches!(
            engine.commit(&keys(&[b"b"]), 10, 10),
            Err(TxnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rollback_fences_start_ts() {
        let (engine, _) = setup();
        prewrite_put(&engine, b"k", &vec![1u8; 300], 5).unwrap();
        engine.batch_rollback(&keys(&[b"k"]), 5).unwrap();

        assert!(engine.get_lock_info(b"k").unwrap().is_none());
        assert!(engine.reader().staged_value(b"k", 5).unwrap().is_none());
        assert!(engine.get_rollback_info(5, b"k").unwrap().is_some());
        assert!(matches!(
            prewrite_put(&engine, b"k", b"again", 5),
            Err(TxnError::TxnRolledBack { start_ts: 5, .. })
        ));
        assert!(matches!(
            engine.commit(&keys(&[b"k"]), 5, 9),
            Err(TxnError::TxnRolledBack { .. })
        ));
        // rollbacks are not write conflicts
        prewrite_put(&engine, b"k", b"v", 4).unwrap();

        prewrite_put(&engine, b"c", b"v", 20).unwrap();
        engine.commit(&keys(&[b"c"]), 20, 21).unwrap();
        assert!(matches!(
            engine.batch_rollback(&keys(&[b"c"]), 20),
            Err(TxnError::AlreadyCommitted { commit_ts: 21, .. })
        ));
    }

    #[test]
    fn test_prewrite_pessimistic_checks() {
        let (engine, _) = setup();
        let mut req = PrewriteRequest::new(vec![Mutation::put(b"p".to_vec(), b"v".to_vec())], b"p".to_vec(), 5, 3000);
        req.pessimistic_checks = vec![true];
        assert!(matches!(
            engine.prewrite(&req),
            Err(TxnError::PessimisticLockNotFound { .. })
        ));

        let lock = vec![Mutation::put(b"p".to_vec(), Vec::new())];
        engine.pessimistic_lock(&lock, b"p", 5, 3000, 6).unwrap();
        req.for_update_ts_checks.insert(0, 7);
        assert!(matches!(
            engine.prewrite(&req),
            Err(TxnError::PessimisticLockNotFound { .. })
        ));

        req.for_update_ts_checks.insert(0, 6);
        req.lock_extra_datas.insert(0, b"extra".to_vec());
        engine.prewrite(&req).unwrap();
        let lock = engine.get_lock_info(b"p").unwrap().unwrap();
        assert_eq!(lock.lock_type, LockType::Put);
        assert_eq!(lock.for_update_ts, 6);
        assert_eq!(lock.extra_data, b"extra");
    }

    #[test]
    fn test_put_if_absent_and_check_not_exists() {
        let (engine, _) = setup();
        prewrite_put(&engine, b"k", b"v", 5).unwrap();
        engine.commit(&keys(&[b"k"]), 5, 6).unwrap();

        let req = PrewriteRequest::new(
            vec![Mutation::with_op(MutationOp::PutIfAbsent, b"k".to_vec(), b"x".to_vec())],
            b"k".to_vec(),
            7,
            3000,
        );
        assert!(matches!(engine.prewrite(&req), Err(TxnError::KeyAlreadyExists { .. })));

        let req = PrewriteRequest::new(
            vec![
                Mutation::with_op(MutationOp::CheckNotExists, b"n".to_vec(), Vec::new()),
                Mutation::with_op(MutationOp::Lock, b"r".to_vec(), Vec::new()),
            ],
            b"r".to_vec(),
            7,
            3000,
        );
        engine.prewrite(&req).unwrap();
        assert!(engine.get_lock_info(b"n").unwrap().is_none());
        assert_eq!(engine.get_lock_info(b"r").unwrap().unwrap().lock_type, LockType::Lock);

        engine.commit(&keys(&[b"r"]), 7, 8).unwrap();
        let (_, write) = engine.reader().seek_write(b"r", 0).unwrap().unwrap();
        assert_eq!(write.kind, WriteKind::Lock);
        assert_eq!(read(&engine, b"r", 0), None);
    }

    #[test]
    fn test_one_pc() {
        let (engine, tso) = setup();
        let mut req = PrewriteRequest::new(vec![Mutation::put(b"k".to_vec(), b"v".to_vec())], b"k".to_vec(), 50, 3000);
        req.try_one_pc = true;

        let response = engine.prewrite(&req).unwrap();
        assert_eq!(response.one_pc_commit_ts, 101);
        assert!(engine.get_lock_info(b"k").unwrap().is_none());
        assert_eq!(read(&engine, b"k", 101), Some(b"v".to_vec()));

        // bound exceeded: falls back to two phases
        tso.set(200);
        req.start_ts = 150;
        req.mutations = vec![Mutation::put(b"j".to_vec(), b"v".to_vec())];
        req.max_commit_ts = 180;
        let response = engine.prewrite(&req).unwrap();
        assert_eq!(response.one_pc_commit_ts, 0);
        assert!(engine.get_lock_info(b"j").unwrap().is_some());
    }

    #[test]
    fn test_check_txn_status() {
        let (engine, _) = setup();
        let start_ts = compose_ts(1_000, 0);
        prewrite_put(&engine, b"pk", b"v", start_ts).unwrap();

        let status = engine
            .check_txn_status(b"pk", start_ts, start_ts + 10, compose_ts(2_000, 0))
            .unwrap();
        assert_eq!(
            status,
            TxnStatus::Locked {
                lock_ttl: 3000,
                min_commit_ts: start_ts + 11
            }
        );
        assert!(matches!(
            engine.commit(&keys(&[b"pk"]), start_ts, start_ts + 5),
            Err(TxnError::CommitTsExpired { .. })
        ));

        let status = engine
            .check_txn_status(b"pk", start_ts, 0, compose_ts(4_001, 0))
            .unwrap();
        assert_eq!(status, TxnStatus::TtlExpireRollback);
        assert!(engine.get_lock_info(b"pk").unwrap().is_none());
        assert_eq!(
            engine.check_txn_status(b"pk", start_ts, 0, 0).unwrap(),
            TxnStatus::RolledBack
        );

        // never seen: fenced with a rollback record
        assert_eq!(
            engine.check_txn_status(b"other", 42, 0, 0).unwrap(),
            TxnStatus::LockNotExistRollback
        );
        assert!(matches!(prewrite_put(&engine, b"other", b"v", 42), Err(TxnError::TxnRolledBack { .. })));

        prewrite_put(&engine, b"done", b"v", 60).unwrap();
        engine.commit(&keys(&[b"done"]), 60, 61).unwrap();
        assert_eq!(
            engine.check_txn_status(b"done", 60, 0, 0).unwrap(),
            TxnStatus::Committed { commit_ts: 61 }
        );
    }

    #[test]
    fn test_resolve_lock_scans_lock_cf() {
        let (engine, _) = setup();
        let req = PrewriteRequest::new(
            vec![Mutation::put(b"a".to_vec(), b"1".to_vec()), Mutation::delete(b"b".to_vec())],
            b"a".to_vec(),
            5,
            3000,
        );
        engine.prewrite(&req).unwrap();
        prewrite_put(&engine, b"c", b"3", 6).unwrap();

        assert_eq!(engine.resolve_lock(5, 9, &[]).unwrap(), 2);
        assert_eq!(read(&engine, b"a", 9), Some(b"1".to_vec()));
        assert!(engine.get_lock_info(b"c").unwrap().is_some());

        assert_eq!(engine.resolve_lock(6, 0, &keys(&[b"c", b"a"])).unwrap(), 1);
        assert!(engine.get_lock_info(b"c").unwrap().is_none());
        assert!(engine.get_rollback_info(6, b"c").unwrap().is_some());
    }

    #[test]
    fn test_resolve_lock_respects_min_commit_ts_and_pessimistic_locks() {
        let (engine, _) = setup();
        let start_ts = compose_ts(1_000, 0);
        prewrite_put(&engine, b"pk", b"v", start_ts).unwrap();
        engine
            .check_txn_status(b"pk", start_ts, start_ts + 10, compose_ts(2_000, 0))
            .unwrap();

        assert!(matches!(
            engine.resolve_lock(start_ts, start_ts + 5, &[]),
            Err(TxnError::CommitTsExpired { min_commit_ts, .. }) if min_commit_ts == start_ts + 11
        ));
        assert!(engine.get_lock_info(b"pk").unwrap().is_some());
        assert_eq!(engine.resolve_lock(start_ts, start_ts + 11, &[]).unwrap(), 1);
        assert_eq!(read(&engine, b"pk", start_ts + 11), Some(b"v".to_vec()));

        let lock = vec![Mutation::with_op(MutationOp::Lock, b"pl".to_vec(), Vec::new())];
        engine.pessimistic_lock(&lock, b"pl", 50, 3000, 50).unwrap();
        assert_eq!(engine.resolve_lock(50, 60, &keys(&[b"pl"])).unwrap(), 1);
        assert!(engine.get_lock_info(b"pl").unwrap().is_none());
        assert_eq!(read(&engine, b"pl", 100), None);
        assert!(engine.get_rollback_info(50, b"pl").unwrap().is_some());
    }

    #[test]
    fn test_heart_beat() {
        let (engine, _) = setup();
        prewrite_put(&engine, b"pk", b"v", 5).unwrap();

        assert_eq!(engine.heart_beat(b"pk", 5, 10_000).unwrap(), 10_000);
        assert_eq!(engine.heart_beat(b"pk", 5, 100).unwrap(), 10_000);
        assert!(matches!(
            engine.heart_beat(b"pk", 6, 100),
            Err(TxnError::TxnNotFound { .. })
        ));
    }

    #[test]
    fn test_delete_range() {
        let (engine, _) = setup();
        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            let ts = 10 * (i as i64 + 1);
            prewrite_put(&engine, *key, b"v", ts).unwrap();
            engine.commit(&keys(&[*key]), ts, ts + 1).unwrap();
        }
        prewrite_put(&engine, b"b", b"locked", 40).unwrap();

        engine.delete_range(b"a", b"c").unwrap();
        assert_eq!(read(&engine, b"a", 0), None);
        assert_eq!(read(&engine, b"b", 0), None);
        assert!(engine.get_lock_info(b"b").unwrap().is_none());
        assert_eq!(read(&engine, b"c", 0), Some(b"v".to_vec()));
        assert!(engine.delete_range(b"c", b"a").is_err());
    }
}
