//! Storage layer shared by the transaction engine and the index store.
//!
//! - `backend`: the [`RawEngine`] capability over named column families
//! - `revision`: `(main, sub)` revisions and their sortable encoding
//! - `codec`: MVCC key/value encoding (ts-complement keys, flagged values)
//! - `mvcc`: stateless versioned reader and write staging
//! - `writer`: timestamped raw KV writes routed through consensus
//! - `compaction`: background compaction and GC driver

pub mod backend;
pub mod codec;
pub mod compaction;
pub mod mvcc;
pub mod revision;
pub mod writer;

pub use backend::{
    BackendConfig, BackendError, BackendResult, MemoryEngine, RawEngine, SledEngine, WriteBatch, WriteOp,
};
pub use compaction::{CompactionMode, Compactor};
pub use mvcc::{KeyValue, MvccReader, MvccWriter, ScanOptions, ScanResult};
pub use revision::Revision;
pub use writer::{RawKvWriter, WriteResponse};

use thiserror::Error;

use crate::consensus::ConsensusError;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key not found")]
    NotFound,

    #[error("Timestamp oracle not available")]
    TsoNotAvailable,

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
