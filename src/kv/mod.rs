//! Revisioned KV-index store.
//!
//! Every key owns a [`KvIndex`]: a chain of generations, each generation one
//! create-to-delete lifecycle holding the revisions that touched the key.
//! Values live in immutable [`KvRevision`] records keyed by revision.
//!
//! - `index`: `KvIndex`, `Generation` and the pure `compact` rebuild
//! - `store`: owned in-memory maps, persistence and the apply handlers
//! - `control`: the request-facing API (validation, revision allocation,
//!   submission through consensus, compaction task)

pub mod control;
pub mod index;
pub mod store;

pub use control::{DeleteRangeResponse, KvControl, KvControlConfig, PutRequest, PutResponse, RangeResponse};
pub use index::{compact, Generation, KvIndex};
pub use store::{AppliedEvent, ApplyReport, KvReader, KvStore};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::ConsensusError;
use crate::storage::{BackendError, Revision, StorageError};

/// Range end sentinel meaning "up to the largest key".
pub const RANGE_END_ALL: &[u8] = b"\0";

/// Index store errors.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Key is empty")]
    KeyEmpty,

    #[error("Key is too long: {len} > {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("Value is empty")]
    ValueEmpty,

    #[error("Value is too long: {len} > {max}")]
    ValueTooLong { len: usize, max: usize },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Lease mismatch: key holds lease {current}, request uses {requested}")]
    LeaseMismatch { current: i64, requested: i64 },

    #[error("Revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("Revision {requested} is in the future (current {current})")]
    FutureRevision { requested: i64, current: i64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Consensus error: {0}")]
    Consensus(ConsensusError),
}

impl KvError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            KvError::KeyEmpty | KvError::KeyTooLong { .. } | KvError::ValueEmpty | KvError::ValueTooLong { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::KeyNotFound(_) | KvError::LeaseNotFound(_))
    }
}

// Rejections raised by the apply handler come back wrapped by consensus.
impl From<ConsensusError> for KvError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::Kv(inner) => *inner,
            other => KvError::Consensus(other),
        }
    }
}

impl From<BackendError> for KvError {
    fn from(e: BackendError) -> Self {
        KvError::Storage(StorageError::Backend(e))
    }
}

impl From<bincode::Error> for KvError {
    fn from(e: bincode::Error) -> Self {
        KvError::Storage(StorageError::from(e))
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Client-facing view of one key version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kv {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

/// Immutable record written once per revision.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRevision {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: i64,
    pub lease: i64,
    pub is_deleted: bool,
}

impl KvRevision {
    pub fn to_kv(&self, keys_only: bool) -> Kv {
        Kv {
            key: self.key.clone(),
            value: if keys_only { Vec::new() } else { self.value.clone() },
            create_revision: self.create_revision.main,
            mod_revision: self.mod_revision.main,
            version: self.version,
            lease: self.lease,
        }
    }
}

/// What an increment does to its key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvIndexEvent {
    Put {
        value: Vec<u8>,
        lease: i64,
        ignore_lease: bool,
        ignore_value: bool,
    },
    Delete,
    Compaction,
}

/// One ordered mutation of the index store, carried through consensus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvIndexIncrement {
    pub key: Vec<u8>,
    pub event: KvIndexEvent,
    /// Put/delete revision, or the compact revision for compactions.
    pub op_revision: Revision,
}

impl KvIndexIncrement {
    pub fn put(key: Vec<u8>, value: Vec<u8>, lease: i64, op_revision: Revision) -> Self {
        Self {
            key,
            event: KvIndexEvent::Put {
                value,
                lease,
                ignore_lease: false,
                ignore_value: false,
            },
            op_revision,
        }
    }

    pub fn delete(key: Vec<u8>, op_revision: Revision) -> Self {
        Self {
            key,
            event: KvIndexEvent::Delete,
            op_revision,
        }
    }

    pub fn compaction(key: Vec<u8>, compact_revision: Revision) -> Self {
        Self {
            key,
            event: KvIndexEvent::Compaction,
            op_revision: compact_revision,
        }
    }
}

/// Whether `key` falls in the range described by `(start, range_end)`.
///
/// An empty `range_end` is an exact match on `start`; [`RANGE_END_ALL`]
/// extends the range to the largest key.
pub fn in_range(key: &[u8], start: &[u8], range_end: &[u8]) -> bool {
    if range_end.is_empty() {
        key == start
    } else if range_end == RANGE_END_ALL {
        key >= start
    } else {
        key >= start && key < range_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range() {
        assert!(in_range(b"a", b"a", b""));
        assert!(!in_range(b"ab", b"a", b""));
        assert!(in_range(b"zzz", b"b", RANGE_END_ALL));
        assert!(!in_range(b"a", b"b", RANGE_END_ALL));
        assert!(in_range(b"b", b"a", b"c"));
        assert!(!in_range(b"c", b"a", b"c"));
    }

    #[test]
    fn test_consensus_error_unwraps_kv_rejection() {
        let wrapped = ConsensusError::Kv(Box::new(KvError::LeaseNotFound(7)));
        assert!(matches!(KvError::from(wrapped), KvError::LeaseNotFound(7)));

        let other = ConsensusError::Apply("boom".to_string());
        assert!(matches!(KvError::from(other), KvError::Consensus(_)));
    }

    #[test]
    fn test_classification() {
        assert!(KvError::KeyTooLong { len: 10, max: 5 }.is_validation());
        assert!(KvError::KeyNotFound("k".to_string()).is_not_found());
        assert!(!KvError::ValueEmpty.is_not_found());
    }
}
