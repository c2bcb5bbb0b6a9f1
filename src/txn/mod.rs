//! Percolator-style transactions over the `lock`, `write` and `data` column
//! families.
//!
//! - `lock` holds at most one [`LockInfo`] per user key, keyed at ts 0.
//! - `write` holds one [`WriteInfo`] per commit (keyed at `commit_ts`) or
//!   rollback (keyed at `start_ts`).
//! - `data` holds committed values too large to inline, keyed at `commit_ts`,
//!   plus values staged at `start_ts` between prewrite and commit.
//!
//! Reads always resolve through `write`, so staged data is never visible.

pub mod engine;
pub mod gc;
pub mod reader;

pub use engine::{PrewriteRequest, PrewriteResponse, TxnEngine};
pub use reader::TxnReader;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::ConsensusError;
use crate::storage::{BackendError, StorageError};

/// Values up to this many bytes are inlined into lock and write records.
pub const SHORT_VALUE_MAX_LEN: usize = 255;

/// Transaction engine errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Key {key:?} is locked by txn {}", .lock.lock_ts)]
    KeyIsLocked { key: Vec<u8>, lock: Box<LockInfo> },

    #[error("Write conflict on {key:?}: start_ts {start_ts}, committed {conflict_start_ts} -> {conflict_commit_ts}")]
    WriteConflict {
        key: Vec<u8>,
        start_ts: i64,
        conflict_start_ts: i64,
        conflict_commit_ts: i64,
    },

    #[error("Lock on {key:?} belongs to txn {lock_ts}, not {start_ts}")]
    TxnLockNotMatch { key: Vec<u8>, start_ts: i64, lock_ts: i64 },

    #[error("Pessimistic lock not found on {key:?} for txn {start_ts}")]
    PessimisticLockNotFound { key: Vec<u8>, start_ts: i64 },

    #[error("Txn {start_ts} was rolled back on {key:?}")]
    TxnRolledBack { key: Vec<u8>, start_ts: i64 },

    #[error("Key already exists: {key:?}")]
    KeyAlreadyExists { key: Vec<u8> },

    #[error("Commit ts {commit_ts} of {key:?} is below min_commit_ts {min_commit_ts}")]
    CommitTsExpired {
        key: Vec<u8>,
        commit_ts: i64,
        min_commit_ts: i64,
    },

    #[error("Txn {start_ts} already committed on {key:?} at {commit_ts}")]
    AlreadyCommitted { key: Vec<u8>, start_ts: i64, commit_ts: i64 },

    #[error("Txn {start_ts} not found on {key:?}")]
    TxnNotFound { key: Vec<u8>, start_ts: i64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl TxnError {
    /// Retryable once the conflicting transaction is resolved.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TxnError::KeyIsLocked { .. }
                | TxnError::WriteConflict { .. }
                | TxnError::TxnLockNotMatch { .. }
                | TxnError::PessimisticLockNotFound { .. }
                | TxnError::TxnRolledBack { .. }
                | TxnError::KeyAlreadyExists { .. }
                | TxnError::CommitTsExpired { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TxnError::TxnNotFound { .. })
    }
}

impl From<bincode::Error> for TxnError {
    fn from(e: bincode::Error) -> Self {
        TxnError::Storage(StorageError::from(e))
    }
}

pub type TxnResult<T> = Result<T, TxnError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    Put,
    Delete,
    /// Read lock from a `Lock` mutation; commits without a value.
    Lock,
    /// Held between pessimistic lock and prewrite.
    Pessimistic,
}

/// An outstanding lock on one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary_lock: Vec<u8>,
    pub lock_ts: i64,
    pub for_update_ts: i64,
    pub lock_ttl: i64,
    pub txn_size: i64,
    pub lock_type: LockType,
    /// Inlined value of a prewritten put, when small enough.
    pub short_value: Option<Vec<u8>>,
    pub extra_data: Vec<u8>,
    pub min_commit_ts: i64,
}

impl LockInfo {
    pub fn is_pessimistic(&self) -> bool {
        self.lock_type == LockType::Pessimistic
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Put,
    Delete,
    Rollback,
    /// Commit of a read lock; carries no value.
    Lock,
}

/// One committed or rolled-back mutation of a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInfo {
    pub start_ts: i64,
    /// Equals `start_ts` for rollback records.
    pub commit_ts: i64,
    pub kind: WriteKind,
    pub short_value: Option<Vec<u8>>,
}

impl WriteInfo {
    /// Put or Delete: the record changes what readers see.
    pub fn is_data_change(&self) -> bool {
        matches!(self.kind, WriteKind::Put | WriteKind::Delete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    Put,
    Delete,
    /// Put that fails with `KeyAlreadyExists` if the key is visible.
    PutIfAbsent,
    /// Existence check only; no lock is written.
    CheckNotExists,
    /// Read lock, no value.
    Lock,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub op: MutationOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutationOp::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    pub fn with_op(op: MutationOp, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    SnapshotIsolation,
    ReadCommitted,
}

/// Per-key conflicts found by a read. The read still returns every key it
/// could resolve; the caller resolves these locks and retries the rest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnResultInfo {
    pub locked: Vec<LockInfo>,
}

impl TxnResultInfo {
    pub fn is_empty(&self) -> bool {
        self.locked.is_empty()
    }
}

/// Outcome of `check_txn_status` on a primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    /// Lock still live; `min_commit_ts` may have been pushed.
    Locked { lock_ttl: i64, min_commit_ts: i64 },
    Committed { commit_ts: i64 },
    RolledBack,
    /// The lock outlived its TTL and was rolled back by this call.
    TtlExpireRollback,
    /// No lock and no record: a rollback was written to fence the txn.
    LockNotExistRollback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let locked = TxnError::KeyIsLocked {
            key: b"k".to_vec(),
            lock: Box::new(LockInfo {
                key: b"k".to_vec(),
                primary_lock: b"k".to_vec(),
                lock_ts: 5,
                for_update_ts: 0,
                lock_ttl: 100,
                txn_size: 1,
                lock_type: LockType::Put,
                short_value: None,
                extra_data: Vec::new(),
                min_commit_ts: 0,
            }),
        };
        assert!(locked.is_conflict());
        assert!(locked.to_string().contains("txn 5"));

        let missing = TxnError::TxnNotFound {
            key: b"k".to_vec(),
            start_ts: 5,
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_conflict());
        assert!(!TxnError::InvalidArgument("x".to_string()).is_conflict());
    }

    #[test]
    fn test_write_info_data_change() {
        let mut write = WriteInfo {
            start_ts: 1,
            commit_ts: 2,
            kind: WriteKind::Put,
            short_value: None,
        };
        assert!(write.is_data_change());
        write.kind = WriteKind::Rollback;
        assert!(!write.is_data_change());
    }
}
