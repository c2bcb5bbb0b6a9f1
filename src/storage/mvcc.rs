//! Timestamped multi-version reads and write staging.
//!
//! Every entry handled here is `(encode_key(user_key, ts), package_value(..))`.
//! [`MvccReader`] answers "newest version <= ts" lookups and version-collapsing
//! scans; [`MvccWriter`] only stages mutations into a [`WriteBatch`], which the
//! caller submits through consensus. Neither keeps any state of its own.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::backend::{RawEngine, WriteBatch};
use crate::storage::codec::{
    decode_key, encode_bytes, encode_key, key_lower_bound, package_value, unpackage_value, PackagedValue,
    ValueFlag, MAX_TS,
};
use crate::storage::StorageResult;

/// Most deletes a single GC command carries.
pub const GC_BATCH_SIZE: usize = 256;

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A user key with its visible value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Parameters of a versioned range scan over `[start, end)`.
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    pub start: Vec<u8>,
    /// Exclusive; empty means unbounded.
    pub end: Vec<u8>,
    /// Read timestamp; 0 reads the newest versions.
    pub ts: i64,
    /// 0 means unlimited.
    pub limit: usize,
    pub keys_only: bool,
    pub reverse: bool,
}

/// One page of a scan.
///
/// When `has_more` is set, resume by passing `end_key` as the next `start`
/// (forward scans) or as the next `end` (reverse scans).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub kvs: Vec<KeyValue>,
    pub has_more: bool,
    pub end_key: Vec<u8>,
}

/// Smallest key strictly greater than `key`.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Encoded bounds covering every version of `key`.
pub fn version_range(key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut end = encode_bytes(key);
    end.extend_from_slice(&[0xFF; 8]);
    end.push(0);
    (key_lower_bound(key), end)
}

/// Encoded bounds covering every version of every key in `[start, end)`.
pub fn encoded_range(start: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let encoded_end = if end.is_empty() {
        Vec::new()
    } else {
        key_lower_bound(end)
    };
    (key_lower_bound(start), encoded_end)
}

fn read_ts(ts: i64) -> i64 {
    if ts <= 0 {
        MAX_TS
    } else {
        ts
    }
}

/// Read-only view over one timestamped column family layout.
#[derive(Clone)]
pub struct MvccReader {
    engine: Arc<dyn RawEngine>,
}

impl MvccReader {
    pub fn new(engine: Arc<dyn RawEngine>) -> Self {
        Self { engine }
    }

    /// Newest version of `key` with ts <= `ts`, tombstones included.
    pub fn get_version(&self, cf: &str, key: &[u8], ts: i64) -> StorageResult<Option<(i64, PackagedValue)>> {
        let (_, end) = version_range(key);
        let start = encode_key(key, read_ts(ts));
        let mut iter = self.engine.scan(cf, &start, &end, false)?;
        match iter.next() {
            Some(item) => {
                let (k, v) = item?;
                let (_, version_ts) = decode_key(&k)?;
                Ok(Some((version_ts, unpackage_value(&v)?)))
            }
            None => Ok(None),
        }
    }

    /// Visible value of `key` at `ts`; deleted and expired versions read as absent.
    pub fn get(&self, cf: &str, key: &[u8], ts: i64) -> StorageResult<Option<Vec<u8>>> {
        let now = now_ms();
        Ok(self
            .get_version(cf, key, ts)?
            .filter(|(_, v)| v.flag != ValueFlag::Delete && !v.is_expired(now))
            .map(|(_, v)| v.payload))
    }

    /// All versions of `key`, newest first.
    pub fn versions(&self, cf: &str, key: &[u8]) -> StorageResult<Vec<(i64, PackagedValue)>> {
        let (start, end) = version_range(key);
        let mut out = Vec::new();
        for item in self.engine.scan(cf, &start, &end, false)? {
            let (k, v) = item?;
            let (_, ts) = decode_key(&k)?;
            out.push((ts, unpackage_value(&v)?));
        }
        Ok(out)
    }

    /// Scans `[start, end)` collapsing each key to its newest visible version.
    pub fn scan(&self, cf: &str, opts: &ScanOptions) -> StorageResult<ScanResult> {
        if opts.reverse {
            self.scan_reverse(cf, opts)
        } else {
            self.scan_forward(cf, opts)
        }
    }

    fn scan_forward(&self, cf: &str, opts: &ScanOptions) -> StorageResult<ScanResult> {
        let ts = read_ts(opts.ts);
        let now = now_ms();
        let (start, end) = encoded_range(&opts.start, &opts.end);
        let mut result = ScanResult::default();

        let mut current: Option<Vec<u8>> = None;
        let mut decided = false;
        for item in self.engine.scan(cf, &start, &end, false)? {
            let (k, v) = item?;
            let (user_key, version_ts) = decode_key(&k)?;
            if current.as_deref() == Some(user_key.as_slice()) {
                if decided {
                    continue;
                }
            } else {
                current = Some(user_key.clone());
                decided = false;
            }
            if version_ts > ts {
                continue;
            }
            decided = true;

            let value = unpackage_value(&v)?;
            if value.flag == ValueFlag::Delete || value.is_expired(now) {
                continue;
            }
            if opts.limit > 0 && result.kvs.len() >= opts.limit {
                result.has_more = true;
                result.end_key = user_key;
                break;
            }
            result.kvs.push(KeyValue {
                key: user_key,
                value: if opts.keys_only { Vec::new() } else { value.payload },
            });
        }
        Ok(result)
    }

    fn scan_reverse(&self, cf: &str, opts: &ScanOptions) -> StorageResult<ScanResult> {
        let ts = read_ts(opts.ts);
        let now = now_ms();
        let (start, end) = encoded_range(&opts.start, &opts.end);
        let mut result = ScanResult::default();

        // Reverse order visits a key's versions oldest first, so the last
        // qualifying version seen for a key is the visible one.
        let mut group: Option<(Vec<u8>, Option<PackagedValue>)> = None;
        let mut iter = self.engine.scan(cf, &start, &end, true)?;
        loop {
            let next = match iter.next() {
                Some(item) => {
                    let (k, v) = item?;
                    let (user_key, version_ts) = decode_key(&k)?;
                    Some((user_key, version_ts, v))
                }
                None => None,
            };

            let finished = match (&group, &next) {
                (Some((key, _)), Some((user_key, _, _))) => key != user_key,
                (Some(_), None) => true,
                _ => false,
            };
            if finished {
                if let Some((key, Some(value))) = group.take() {
                    if value.flag != ValueFlag::Delete && !value.is_expired(now) {
                        if opts.limit > 0 && result.kvs.len() >= opts.limit {
                            result.has_more = true;
                            result.end_key = next_key(&key);
                            return Ok(result);
                        }
                        result.kvs.push(KeyValue {
                            key,
                            value: if opts.keys_only { Vec::new() } else { value.payload },
                        });
                    }
                }
                group = None;
            }

            let Some((user_key, version_ts, raw)) = next else {
                break;
            };
            let entry = group.get_or_insert_with(|| (user_key, None));
            if version_ts <= ts {
                entry.1 = Some(unpackage_value(&raw)?);
            }
        }
        Ok(result)
    }

    /// Stages removal of versions no reader at or after `safe_point` can see,
    /// in batches of at most [`GC_BATCH_SIZE`] deletes.
    ///
    /// For each key the newest version with ts <= `safe_point` is kept, as is
    /// everything newer; only the older versions are dropped.
    pub fn collect_gc(&self, cf: &str, safe_point: i64) -> StorageResult<Vec<WriteBatch>> {
        let mut batches = Vec::new();
        let mut batch = WriteBatch::new();
        let mut current: Option<Vec<u8>> = None;
        let mut kept_visible = false;
        for item in self.engine.scan(cf, &[], &[], false)? {
            let (k, _) = item?;
            let (user_key, ts) = decode_key(&k)?;
            if current.as_deref() != Some(user_key.as_slice()) {
                current = Some(user_key);
                kept_visible = false;
            }
            if ts > safe_point {
                continue;
            }
            if kept_visible {
                batch.delete(cf, k);
                if batch.len() >= GC_BATCH_SIZE {
                    batches.push(std::mem::take(&mut batch));
                }
            } else {
                kept_visible = true;
            }
        }
        if !batch.is_empty() {
            batches.push(batch);
        }
        Ok(batches)
    }
}

/// Staging helpers for timestamped writes.
pub struct MvccWriter;

impl MvccWriter {
    pub fn put(batch: &mut WriteBatch, cf: &str, key: &[u8], ts: i64, value: &[u8]) {
        batch.put(cf, encode_key(key, ts), package_value(ValueFlag::Put, 0, value));
    }

    /// `ttl` is an absolute expiry in unix milliseconds.
    pub fn put_with_ttl(batch: &mut WriteBatch, cf: &str, key: &[u8], ts: i64, value: &[u8], ttl: i64) {
        batch.put(cf, encode_key(key, ts), package_value(ValueFlag::PutTtl, ttl, value));
    }

    /// Writes a tombstone version; older versions stay readable below `ts`.
    pub fn delete(batch: &mut WriteBatch, cf: &str, key: &[u8], ts: i64) {
        batch.put(cf, encode_key(key, ts), package_value(ValueFlag::Delete, 0, &[]));
    }

    /// Physically removes every version of every key in `[start, end)`.
    pub fn delete_range(batch: &mut WriteBatch, cf: &str, start: &[u8], end: &[u8]) {
        let (start, end) = encoded_range(start, end);
        batch.delete_range(cf, start, end);
    }
}
