//! Raw KV writes against the timestamped `default` column family.
//!
//! Each mutating call takes one timestamp from the oracle, stages versions
//! through [`MvccWriter`] and submits the batch through consensus. The
//! assigned timestamp is reported back through [`WriteResponse`].

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::consensus::{Command, ConsensusEngine};
use crate::storage::backend::{RawEngine, WriteBatch, CF_DEFAULT};
use crate::storage::mvcc::{now_ms, KeyValue, MvccReader, MvccWriter, ScanOptions, ScanResult};
use crate::storage::{StorageError, StorageResult};
use crate::tso::TimestampOracle;

/// Response payload of a raw write; every variant carries the assigned ts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteResponse {
    Put { ts: i64 },
    Delete { ts: i64, key_states: Vec<bool> },
    DeleteRange { ts: i64, delete_count: usize },
    PutIfAbsent { ts: i64, key_states: Vec<bool> },
    CompareAndSet { ts: i64, key_states: Vec<bool> },
}

impl WriteResponse {
    pub fn set_assigned_ts(&mut self, assigned: i64) {
        match self {
            WriteResponse::Put { ts }
            | WriteResponse::Delete { ts, .. }
            | WriteResponse::DeleteRange { ts, .. }
            | WriteResponse::PutIfAbsent { ts, .. }
            | WriteResponse::CompareAndSet { ts, .. } => *ts = assigned,
        }
    }

    pub fn assigned_ts(&self) -> i64 {
        match self {
            WriteResponse::Put { ts }
            | WriteResponse::Delete { ts, .. }
            | WriteResponse::DeleteRange { ts, .. }
            | WriteResponse::PutIfAbsent { ts, .. }
            | WriteResponse::CompareAndSet { ts, .. } => *ts,
        }
    }

    pub fn key_states(&self) -> &[bool] {
        match self {
            WriteResponse::Delete { key_states, .. }
            | WriteResponse::PutIfAbsent { key_states, .. }
            | WriteResponse::CompareAndSet { key_states, .. } => key_states,
            _ => &[],
        }
    }
}

/// Timestamped raw KV writer.
pub struct RawKvWriter {
    reader: MvccReader,
    consensus: Arc<dyn ConsensusEngine>,
    tso: Arc<dyn TimestampOracle>,
    // Conditional writes read before they submit.
    write_latch: Mutex<()>,
}

fn check_key(key: &[u8]) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidArgument("key is empty".to_string()));
    }
    Ok(())
}

impl RawKvWriter {
    pub fn new(
        engine: Arc<dyn RawEngine>,
        consensus: Arc<dyn ConsensusEngine>,
        tso: Arc<dyn TimestampOracle>,
    ) -> Self {
        Self {
            reader: MvccReader::new(engine),
            consensus,
            tso,
            write_latch: Mutex::new(()),
        }
    }

    fn next_ts(&self) -> StorageResult<i64> {
        match self.tso.get_ts() {
            0 => Err(StorageError::TsoNotAvailable),
            ts => Ok(ts),
        }
    }

    fn submit(&self, batch: WriteBatch, response: &mut WriteResponse, ts: i64) -> StorageResult<()> {
        if !batch.is_empty() {
            self.consensus.submit_sync(Command::Write(batch))?;
            response.set_assigned_ts(ts);
        }
        Ok(())
    }

    fn visible(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.reader.get(CF_DEFAULT, key, 0)
    }

    /// Value of `key` at `ts` (0 reads the newest version).
    pub fn kv_get(&self, key: &[u8], ts: i64) -> StorageResult<Option<Vec<u8>>> {
        self.reader.get(CF_DEFAULT, key, ts)
    }

    pub fn kv_scan(&self, opts: &ScanOptions) -> StorageResult<ScanResult> {
        self.reader.scan(CF_DEFAULT, opts)
    }

    /// Writes every pair at one timestamp. `ttl_ms > 0` makes the versions
    /// expire `ttl_ms` milliseconds from now.
    pub fn kv_put(&self, kvs: &[KeyValue], ttl_ms: i64) -> StorageResult<WriteResponse> {
        for kv in kvs {
            check_key(&kv.key)?;
        }
        let _guard = self.write_latch.lock();
        let ts = self.next_ts()?;

        let mut batch = WriteBatch::new();
        for kv in kvs {
            if ttl_ms > 0 {
                MvccWriter::put_with_ttl(&mut batch, CF_DEFAULT, &kv.key, ts, &kv.value, now_ms() + ttl_ms);
            } else {
                MvccWriter::put(&mut batch, CF_DEFAULT, &kv.key, ts, &kv.value);
            }
        }

        let mut response = WriteResponse::Put { ts: 0 };
        self.submit(batch, &mut response, ts)?;
        debug!(count = kvs.len(), ts, "Raw put applied");
        Ok(response)
    }

    /// Tombstones each key; `key_states[i]` tells whether key i was visible.
    pub fn kv_delete(&self, keys: &[Vec<u8>]) -> StorageResult<WriteResponse> {
        for key in keys {
            check_key(key)?;
        }
        let _guard = self.write_latch.lock();
        let ts = self.next_ts()?;

        let mut batch = WriteBatch::new();
        let mut key_states = Vec::with_capacity(keys.len());
        for key in keys {
            let exists = self.visible(key)?.is_some();
            if exists {
                MvccWriter::delete(&mut batch, CF_DEFAULT, key, ts);
            }
            key_states.push(exists);
        }

        let mut response = WriteResponse::Delete { ts: 0, key_states };
        self.submit(batch, &mut response, ts)?;
        Ok(response)
    }

    /// Tombstones every visible key in `[start, end)`.
    pub fn kv_delete_range(&self, start: &[u8], end: &[u8]) -> StorageResult<WriteResponse> {
        if !end.is_empty() && start >= end {
            return Err(StorageError::InvalidArgument("range start must be below end".to_string()));
        }
        let _guard = self.write_latch.lock();
        let ts = self.next_ts()?;

        let live = self.reader.scan(
            CF_DEFAULT,
            &ScanOptions {
                start: start.to_vec(),
                end: end.to_vec(),
                keys_only: true,
                ..Default::default()
            },
        )?;

        let mut batch = WriteBatch::new();
        for kv in &live.kvs {
            MvccWriter::delete(&mut batch, CF_DEFAULT, &kv.key, ts);
        }

        let mut response = WriteResponse::DeleteRange {
            ts: 0,
            delete_count: live.kvs.len(),
        };
        self.submit(batch, &mut response, ts)?;
        Ok(response)
    }

    /// Writes pairs whose key is not visible. A key repeated in `kvs` counts
    /// as present after its first occurrence. With `is_atomic`, one existing
    /// key fails the whole batch.
    pub fn kv_put_if_absent(&self, kvs: &[KeyValue], is_atomic: bool) -> StorageResult<WriteResponse> {
        for kv in kvs {
            check_key(&kv.key)?;
        }
        let _guard = self.write_latch.lock();
        let ts = self.next_ts()?;

        let mut seen = HashSet::with_capacity(kvs.len());
        let mut key_states = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let first = seen.insert(kv.key.as_slice());
            key_states.push(first && self.visible(&kv.key)?.is_none());
        }
        if is_atomic && key_states.iter().any(|ok| !ok) {
            return Ok(WriteResponse::PutIfAbsent {
                ts: 0,
                key_states: vec![false; kvs.len()],
            });
        }

        let mut batch = WriteBatch::new();
        for (kv, ok) in kvs.iter().zip(&key_states) {
            if *ok {
                MvccWriter::put(&mut batch, CF_DEFAULT, &kv.key, ts, &kv.value);
            }
        }

        let mut response = WriteResponse::PutIfAbsent { ts: 0, key_states };
        self.submit(batch, &mut response, ts)?;
        Ok(response)
    }

    /// Sets `kvs[i]` when the visible value equals `expect_values[i]` (an
    /// empty expectation means "absent"). An empty new value deletes the key.
    pub fn kv_compare_and_set(
        &self,
        kvs: &[KeyValue],
        expect_values: &[Vec<u8>],
        is_atomic: bool,
    ) -> StorageResult<WriteResponse> {
        if kvs.len() != expect_values.len() {
            return Err(StorageError::InvalidArgument(format!(
                "{} kvs but {} expected values",
                kvs.len(),
                expect_values.len()
            )));
        }
        for kv in kvs {
            check_key(&kv.key)?;
        }
        let _guard = self.write_latch.lock();
        let ts = self.next_ts()?;

        let mut key_states = Vec::with_capacity(kvs.len());
        for (kv, expect) in kvs.iter().zip(expect_values) {
            let matched = match self.visible(&kv.key)? {
                Some(current) => !expect.is_empty() && current == *expect,
                None => expect.is_empty(),
            };
            key_states.push(matched);
        }
        if is_atomic && key_states.iter().any(|ok| !ok) {
            return Ok(WriteResponse::CompareAndSet {
                ts: 0,
                key_states: vec![false; kvs.len()],
            });
        }

        let mut batch = WriteBatch::new();
        for (kv, ok) in kvs.iter().zip(&key_states) {
            if !*ok {
                continue;
            }
            if kv.value.is_empty() {
                MvccWriter::delete(&mut batch, CF_DEFAULT, &kv.key, ts);
            } else {
                MvccWriter::put(&mut batch, CF_DEFAULT, &kv.key, ts, &kv.value);
            }
        }

        let mut response = WriteResponse::CompareAndSet { ts: 0, key_states };
        self.submit(batch, &mut response, ts)?;
        Ok(response)
    }

    /// Drops versions of the `default` family hidden below `safe_point`.
    pub fn gc(&self, safe_point: i64) -> StorageResult<usize> {
        let _guard = self.write_latch.lock();
        let mut removed = 0;
        for batch in self.reader.collect_gc(CF_DEFAULT, safe_point)? {
            let len = batch.len();
            self.consensus.submit_sync(Command::Write(batch))?;
            removed += len;
        }
        Ok(removed)
    }
}
