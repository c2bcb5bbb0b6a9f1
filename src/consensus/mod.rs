//! Ordered, durable application of mutating commands.
//!
//! Engines never write their column families directly. They build a
//! [`Command`] and hand it to [`ConsensusEngine::submit_sync`], which records
//! it in the command log, applies it through the node's [`ApplyHandler`] and
//! returns only after the apply finished. Apply order equals log order, which
//! is also the order revisions and commit timestamps were handed out.

pub mod local;
pub mod log;

pub use local::LocalConsensus;
pub use log::{CommandLog, LogEntry};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::{KvError, KvIndexIncrement};
use crate::storage::backend::{BackendError, WriteBatch};

/// Consensus and apply errors.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Log error: {0}")]
    Log(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The index store rejected the command at apply time.
    #[error("Index store rejected command: {0}")]
    Kv(Box<KvError>),

    #[error("Apply failed: {0}")]
    Apply(String),
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// A replicated state-machine command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Raw column family mutations (transaction engine, raw KV writer, GC).
    Write(WriteBatch),
    /// Index-store puts, deletes and compactions, applied in order.
    KvIndex(Vec<KvIndexIncrement>),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Write(_) => "write",
            Command::KvIndex(_) => "kv_index",
        }
    }
}

/// Result of applying one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Set when the command was applied but a follow-up local step
    /// (e.g. persisting the in-memory index) failed.
    pub warnings: Vec<String>,
}

impl ApplyOutcome {
    pub fn merge(&mut self, other: ApplyOutcome) {
        self.warnings.extend(other.warnings);
    }
}

/// The state machine side: invoked once per log entry, in log order.
pub trait ApplyHandler: Send + Sync {
    fn apply(&self, index: u64, command: &Command) -> ConsensusResult<ApplyOutcome>;
}

/// The submitter side.
pub trait ConsensusEngine: Send + Sync {
    /// Blocks until `command` is durably ordered and applied.
    fn submit_sync(&self, command: Command) -> ConsensusResult<ApplyOutcome>;
}
