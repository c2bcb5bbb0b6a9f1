//! Garbage collection of write records and committed values.

use tracing::info;

use crate::storage::backend::{WriteBatch, CF_DATA, CF_WRITE};
use crate::storage::codec::decode_key;
use crate::storage::mvcc::GC_BATCH_SIZE;
use crate::txn::engine::TxnEngine;
use crate::txn::reader::version_key;
use crate::txn::{TxnResult, WriteInfo, WriteKind};

/// Per-key GC state while walking a key's write records newest first.
#[derive(Default)]
struct KeyGc {
    key: Vec<u8>,
    /// The newest Put/Delete at or below the safe point has been kept.
    kept: bool,
}

fn stage_gc(batch: &mut WriteBatch, key: &[u8], commit_ts: i64, write: &WriteInfo) {
    batch.delete(CF_WRITE, version_key(key, commit_ts));
    if write.kind == WriteKind::Put && write.short_value.is_none() {
        batch.delete(CF_DATA, version_key(key, commit_ts));
    }
}

impl TxnEngine {
    /// Drops history no reader at or after `safe_point_ts` can observe.
    ///
    /// Per key, records newer than the safe point stay. At or below it, the
    /// newest Put or Delete stays (it is what a read at the safe point
    /// returns) and everything older goes, along with rollback and lock
    /// records. Deletes go out in commands of about [`GC_BATCH_SIZE`] ops.
    /// Returns the number of write records removed.
    pub fn gc(&self, safe_point_ts: i64) -> TxnResult<usize> {
        if safe_point_ts <= 0 {
            return Ok(0);
        }

        let _guard = self.latch();
        let mut batch = WriteBatch::new();
        let mut removed = 0;
        let mut state = KeyGc::default();
        for item in self.reader().engine().scan(CF_WRITE, &[], &[], false)? {
            let (k, v) = item?;
            let (user_key, commit_ts) = decode_key(&k)?;
            if user_key != state.key {
                state = KeyGc {
                    key: user_key,
                    kept: false,
                };
            }
            if commit_ts > safe_point_ts {
                continue;
            }

            let write: WriteInfo = bincode::deserialize(&v)?;
            if !state.kept && write.is_data_change() {
                state.kept = true;
                continue;
            }
            stage_gc(&mut batch, &state.key, commit_ts, &write);
            removed += 1;
            if batch.len() >= GC_BATCH_SIZE {
                self.submit_batch(std::mem::take(&mut batch))?;
            }
        }

        if !batch.is_empty() {
            self.submit_batch(batch)?;
        }
        if removed > 0 {
            info!(safe_point_ts, removed, "Txn GC finished");
        }
        Ok(removed)
    }
}
