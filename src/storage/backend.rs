//! Raw storage engines addressed by named column families.
//!
//! Everything above this layer (the MVCC codec, the transaction engine and the
//! revisioned index store) talks to storage only through the [`RawEngine`]
//! trait, so the backend can be swapped without touching MVCC logic:
//!
//! - [`SledEngine`]: persistent, one sled tree per column family
//! - [`MemoryEngine`]: `BTreeMap` per column family, used by tests and
//!   ephemeral nodes
//!
//! Column families:
//! - `default`: timestamped raw key-values written by the raw KV writer
//! - `lock`, `write`, `data`: the transaction engine's three families
//! - `kv_index`, `kv_rev`: the revisioned index store
//! - `meta`: small bookkeeping values (applied index, counters)
//! - `log`: the consensus command log

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeBounds};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const CF_DEFAULT: &str = "default";
pub const CF_LOCK: &str = "lock";
pub const CF_WRITE: &str = "write";
pub const CF_DATA: &str = "data";
pub const CF_KV_INDEX: &str = "kv_index";
pub const CF_KV_REV: &str = "kv_rev";
pub const CF_META: &str = "meta";
pub const CF_LOG: &str = "log";

/// Every column family a node opens.
pub const ALL_CFS: &[&str] = &[
    CF_DEFAULT,
    CF_LOCK,
    CF_WRITE,
    CF_DATA,
    CF_KV_INDEX,
    CF_KV_REV,
    CF_META,
    CF_LOG,
];

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Write batch aborted")]
    TransactionAborted,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// An owned key-value pair as returned by scans.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy scan iterator borrowed from the engine.
pub type KvIter<'a> = Box<dyn Iterator<Item = BackendResult<KvPair>> + 'a>;

/// A single mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
    /// Removes every key in `[start, end)`; an empty `end` is unbounded.
    DeleteRange {
        cf: String,
        start: Vec<u8>,
        end: Vec<u8>,
    },
}

impl WriteOp {
    pub fn cf(&self) -> &str {
        match self {
            WriteOp::Put { cf, .. } | WriteOp::Delete { cf, .. } | WriteOp::DeleteRange { cf, .. } => cf,
        }
    }
}

/// Mutations applied atomically across column families.
///
/// Engines stage nothing themselves; callers build a batch and hand it to the
/// consensus path, whose apply handler calls [`RawEngine::write`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(&mut self, cf: &str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            cf: cf.to_string(),
            key,
            value,
        });
    }

    pub fn delete(&mut self, cf: &str, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete {
            cf: cf.to_string(),
            key,
        });
    }

    pub fn delete_range(&mut self, cf: &str, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(WriteOp::DeleteRange {
            cf: cf.to_string(),
            start,
            end,
        });
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Read/write capability over named column families.
///
/// Reads never block writers: sled reads are lock-free and the memory engine
/// copies the requested range out under a short read lock.
pub trait RawEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn get(&self, cf: &str, key: &[u8]) -> BackendResult<Option<Vec<u8>>>;

    /// Iterates `[start, end)` in key order (descending when `reverse`).
    /// An empty `end` means "to the last key of the column family".
    fn scan<'a>(&'a self, cf: &str, start: &[u8], end: &[u8], reverse: bool) -> BackendResult<KvIter<'a>>;

    /// Applies all operations of the batch atomically.
    fn write(&self, batch: WriteBatch) -> BackendResult<()>;

    fn put(&self, cf: &str, key: &[u8], value: &[u8]) -> BackendResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(cf, key.to_vec(), value.to_vec());
        self.write(batch)
    }

    fn delete(&self, cf: &str, key: &[u8]) -> BackendResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(cf, key.to_vec());
        self.write(batch)
    }

    fn get_all_keys(&self, cf: &str) -> BackendResult<Vec<Vec<u8>>> {
        self.scan(cf, &[], &[], false)?
            .map(|item| item.map(|(k, _)| k))
            .collect()
    }

    fn flush(&self) -> BackendResult<()> {
        Ok(())
    }
}

fn range_bounds(start: &[u8], end: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    };
    (Bound::Included(start.to_vec()), upper)
}

/// Configuration for the persistent backend.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages to disk.
    pub flush_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
        }
    }
}

/// Persistent engine: one sled tree per column family.
pub struct SledEngine {
    db: sled::Db,
    trees: HashMap<&'static str, sled::Tree>,
}

impl SledEngine {
    /// Opens (or creates) the database and every column family.
    pub fn open(config: &BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Opening sled engine at {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .open()
            .map_err(|e| BackendError::ConfigError(format!("Failed to open sled database: {}", e)))?;

        let mut trees = HashMap::new();
        for cf in ALL_CFS {
            trees.insert(*cf, db.open_tree(cf)?);
        }

        info!(
            "Sled engine opened with cache_size={}MB, flush_interval={}ms",
            config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Arc::new(Self { db, trees }))
    }

    fn tree(&self, cf: &str) -> BackendResult<&sled::Tree> {
        self.trees
            .get(cf)
            .ok_or_else(|| BackendError::ColumnFamilyNotFound(cf.to_string()))
    }

    /// Approximate on-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl RawEngine for SledEngine {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn get(&self, cf: &str, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.tree(cf)?.get(key)?.map(|v| v.to_vec()))
    }

    fn scan<'a>(&'a self, cf: &str, start: &[u8], end: &[u8], reverse: bool) -> BackendResult<KvIter<'a>> {
        let tree = self.tree(cf)?;
        let iter = tree
            .range::<Vec<u8>, _>(range_bounds(start, end))
            .map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(BackendError::from)
            });
        if reverse {
            Ok(Box::new(iter.rev()))
        } else {
            Ok(Box::new(iter))
        }
    }

    fn write(&self, batch: WriteBatch) -> BackendResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Group per tree; range deletes are expanded to point deletes up front
        // since transactional trees cannot iterate. They also cover puts staged
        // earlier in this batch.
        let mut names: Vec<&str> = Vec::new();
        let mut batches: Vec<sled::Batch> = Vec::new();
        let mut staged: Vec<Vec<&[u8]>> = Vec::new();
        for op in batch.ops() {
            let pos = match names.iter().position(|n| *n == op.cf()) {
                Some(pos) => pos,
                None => {
                    self.tree(op.cf())?;
                    names.push(op.cf());
                    batches.push(sled::Batch::default());
                    staged.push(Vec::new());
                    names.len() - 1
                }
            };
            match op {
                WriteOp::Put { key, value, .. } => {
                    batches[pos].insert(key.as_slice(), value.as_slice());
                    staged[pos].push(key.as_slice());
                }
                WriteOp::Delete { key, .. } => batches[pos].remove(key.as_slice()),
                WriteOp::DeleteRange { cf, start, end } => {
                    let bounds = range_bounds(start, end);
                    for item in self.tree(cf)?.range::<Vec<u8>, _>(bounds.clone()) {
                        let (k, _) = item?;
                        batches[pos].remove(k);
                    }
                    for key in staged[pos].iter().filter(|key| bounds.contains(&key.to_vec())) {
                        batches[pos].remove(*key);
                    }
                }
            }
        }

        if names.len() == 1 {
            let tree = self.tree(names[0])?;
            if let Some(single) = batches.pop() {
                tree.apply_batch(single)?;
            }
            return Ok(());
        }

        let trees: Vec<sled::Tree> = names
            .iter()
            .map(|n| self.tree(n).cloned())
            .collect::<BackendResult<_>>()?;

        trees
            .as_slice()
            .transaction(|tx_trees| {
                for (tx, b) in tx_trees.iter().zip(batches.iter()) {
                    tx.apply_batch(b)?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Abort(()) => BackendError::TransactionAborted,
                TransactionError::Storage(e) => BackendError::SledError(e),
            })
    }

    fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Volatile engine backed by one `BTreeMap` per column family.
pub struct MemoryEngine {
    cfs: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        let cfs = ALL_CFS
            .iter()
            .map(|cf| (cf.to_string(), BTreeMap::new()))
            .collect();
        Arc::new(Self {
            cfs: RwLock::new(cfs),
        })
    }
}

impl RawEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, cf: &str, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        let cfs = self.cfs.read();
        let map = cfs
            .get(cf)
            .ok_or_else(|| BackendError::ColumnFamilyNotFound(cf.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn scan<'a>(&'a self, cf: &str, start: &[u8], end: &[u8], reverse: bool) -> BackendResult<KvIter<'a>> {
        let cfs = self.cfs.read();
        let map = cfs
            .get(cf)
            .ok_or_else(|| BackendError::ColumnFamilyNotFound(cf.to_string()))?;
        let mut items: Vec<KvPair> = map
            .range::<Vec<u8>, _>(range_bounds(start, end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if reverse {
            items.reverse();
        }
        Ok(Box::new(items.into_iter().map(Ok)))
    }

    fn write(&self, batch: WriteBatch) -> BackendResult<()> {
        let mut cfs = self.cfs.write();
        for op in batch.ops() {
            if !cfs.contains_key(op.cf()) {
                return Err(BackendError::ColumnFamilyNotFound(op.cf().to_string()));
            }
        }
        for op in batch.ops() {
            let Some(map) = cfs.get_mut(op.cf()) else {
                continue;
            };
            match op {
                WriteOp::Put { key, value, .. } => {
                    map.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key, .. } => {
                    map.remove(key);
                }
                WriteOp::DeleteRange { start, end, .. } => {
                    let doomed: Vec<Vec<u8>> = map
                        .range::<Vec<u8>, _>(range_bounds(start, end))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        map.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engines(temp_dir: &TempDir) -> Vec<Arc<dyn RawEngine>> {
        let config = BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            cache_size_mb: 16,
            flush_interval_ms: 100,
        };
        vec![SledEngine::open(&config).unwrap(), MemoryEngine::new()]
    }

    #[test]
    fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        for engine in engines(&temp_dir) {
            engine.put(CF_DEFAULT, b"test_key", b"test_value").unwrap();
            assert_eq!(
                engine.get(CF_DEFAULT, b"test_key").unwrap(),
                Some(b"test_value".to_vec()),
                "{}",
                engine.name()
            );

            engine.delete(CF_DEFAULT, b"test_key").unwrap();
            assert_eq!(engine.get(CF_DEFAULT, b"test_key").unwrap(), None);
        }
    }

    #[test]
    fn test_delete_range_covers_staged_puts() {
        let temp_dir = TempDir::new().unwrap();
        for engine in engines(&temp_dir) {
            engine.put(CF_DEFAULT, b"a", b"old").unwrap();

            let mut batch = WriteBatch::new();
            batch.put(CF_DEFAULT, b"b".to_vec(), b"staged".to_vec());
            batch.put(CF_DEFAULT, b"z".to_vec(), b"outside".to_vec());
            batch.delete_range(CF_DEFAULT, b"a".to_vec(), b"c".to_vec());
            batch.put(CF_DEFAULT, b"a".to_vec(), b"after".to_vec());
            engine.write(batch).unwrap();

            assert_eq!(engine.get(CF_DEFAULT, b"a").unwrap(), Some(b"after".to_vec()), "{}", engine.name());
            assert_eq!(engine.get(CF_DEFAULT, b"b").unwrap(), None, "{}", engine.name());
            assert_eq!(engine.get(CF_DEFAULT, b"z").unwrap(), Some(b"outside".to_vec()));
        }
    }

    #[test]
    fn test_unknown_column_family() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.get("nope", b"k"),
            Err(BackendError::ColumnFamilyNotFound(_))
        ));
    }

    #[test]
    fn test_batch_spans_column_families() {
        let temp_dir = TempDir::new().unwrap();
        for engine in engines(&temp_dir) {
            let mut batch = WriteBatch::new();
            batch.put(CF_LOCK, b"k".to_vec(), b"lock".to_vec());
            batch.put(CF_WRITE, b"k".to_vec(), b"write".to_vec());
            batch.put(CF_DATA, b"k".to_vec(), b"data".to_vec());
            engine.write(batch).unwrap();

            assert_eq!(engine.get(CF_LOCK, b"k").unwrap(), Some(b"lock".to_vec()));
            assert_eq!(engine.get(CF_WRITE, b"k").unwrap(), Some(b"write".to_vec()));
            assert_eq!(engine.get(CF_DATA, b"k").unwrap(), Some(b"data".to_vec()));
        }
    }

    #[test]
    fn test_scan_forward_and_reverse() {
        let temp_dir = TempDir::new().unwrap();
        for engine in engines(&temp_dir) {
            let mut batch = WriteBatch::new();
            for k in [b"a", b"b", b"c", b"d"] {
                batch.put(CF_DEFAULT, k.to_vec(), k.to_vec());
            }
            engine.write(batch).unwrap();

            let forward: Vec<_> = engine
                .scan(CF_DEFAULT, b"b", b"d", false)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect();
            assert_eq!(forward, vec![b"b".to_vec(), b"c".to_vec()]);

            let reverse: Vec<_> = engine
                .scan(CF_DEFAULT, b"a", b"", true)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect();
            assert_eq!(reverse.first(), Some(&b"d".to_vec()));
            assert_eq!(reverse.len(), 4);
        }
    }

    #[test]
    fn test_delete_range() {
        let temp_dir = TempDir::new().unwrap();
        for engine in engines(&temp_dir) {
            let mut batch = WriteBatch::new();
            for k in [b"a", b"b", b"c"] {
                batch.put(CF_DATA, k.to_vec(), b"v".to_vec());
            }
            engine.write(batch).unwrap();

            let mut batch = WriteBatch::new();
            batch.delete_range(CF_DATA, b"a".to_vec(), b"c".to_vec());
            engine.write(batch).unwrap();

            assert_eq!(engine.get_all_keys(CF_DATA).unwrap(), vec![b"c".to_vec()]);
        }
    }
}
