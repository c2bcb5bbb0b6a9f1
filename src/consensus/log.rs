use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Command, ConsensusError, ConsensusResult};
use crate::storage::backend::{RawEngine, WriteBatch, CF_LOG, CF_META};

const ENTRY_PREFIX: &[u8] = b"entry:";
const FIRST_INDEX_KEY: &[u8] = b"log_first_index";
const LAST_INDEX_KEY: &[u8] = b"log_last_index";
const APPLIED_INDEX_KEY: &[u8] = b"log_applied_index";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

fn entry_key(index: u64) -> Vec<u8> {
    let mut key = ENTRY_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8], what: &str) -> ConsensusResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ConsensusError::Log(format!("Invalid {} size", what)))?;
    Ok(u64::from_le_bytes(arr))
}

/// Durable command log kept in the `log` column family.
pub struct CommandLog {
    engine: Arc<dyn RawEngine>,
    first_index: AtomicU64,
    last_index: AtomicU64,
    applied_index: AtomicU64,
}

impl CommandLog {
    pub fn new(engine: Arc<dyn RawEngine>) -> ConsensusResult<Self> {
        let log = Self {
            engine,
            first_index: AtomicU64::new(1),
            last_index: AtomicU64::new(0),
            applied_index: AtomicU64::new(0),
        };

        log.recover()?;
        Ok(log)
    }

    fn recover(&self) -> ConsensusResult<()> {
        if let Some(bytes) = self.engine.get(CF_META, FIRST_INDEX_KEY)? {
            self.first_index
                .store(decode_u64(&bytes, "first_index")?, Ordering::Release);
        }
        if let Some(bytes) = self.engine.get(CF_META, LAST_INDEX_KEY)? {
            self.last_index
                .store(decode_u64(&bytes, "last_index")?, Ordering::Release);
        }
        if let Some(bytes) = self.engine.get(CF_META, APPLIED_INDEX_KEY)? {
            self.applied_index
                .store(decode_u64(&bytes, "applied_index")?, Ordering::Release);
        }
        Ok(())
    }

    /// Appends one entry and advances `last_index` in the same batch.
    pub fn append(&self, entry: &LogEntry) -> ConsensusResult<()> {
        let value = bincode::serialize(entry)
            .map_err(|e| ConsensusError::Log(format!("Serialize error: {}", e)))?;

        let mut batch = WriteBatch::new();
        batch.put(CF_LOG, entry_key(entry.index), value);
        batch.put(CF_META, LAST_INDEX_KEY.to_vec(), entry.index.to_le_bytes().to_vec());
        self.engine.write(batch)?;

        self.last_index.store(entry.index, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, index: u64) -> ConsensusResult<Option<LogEntry>> {
        if index < self.first_index.load(Ordering::Acquire) {
            return Ok(None);
        }

        match self.engine.get(CF_LOG, &entry_key(index))? {
            Some(bytes) => {
                let entry = bincode::deserialize::<LogEntry>(&bytes)
                    .map_err(|e| ConsensusError::Log(format!("Deserialize error: {}", e)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Entries with `index >= start`, in order.
    pub fn entries_from(&self, start: u64) -> ConsensusResult<Vec<LogEntry>> {
        let start = start.max(self.first_index.load(Ordering::Acquire));
        let last = self.last_index.load(Ordering::Acquire);

        let mut entries = Vec::new();
        for index in start..=last {
            if let Some(entry) = self.get(index)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Drops every entry below `index`.
    pub fn truncate_before(&self, index: u64) -> ConsensusResult<()> {
        let first = self.first_index.load(Ordering::Acquire);

        if index <= first {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        batch.delete_range(CF_LOG, entry_key(first), entry_key(index));
        batch.put(CF_META, FIRST_INDEX_KEY.to_vec(), index.to_le_bytes().to_vec());
        self.engine.write(batch)?;

        self.first_index.store(index, Ordering::Release);
        Ok(())
    }

    pub fn save_applied(&self, index: u64) -> ConsensusResult<()> {
        self.engine
            .put(CF_META, APPLIED_INDEX_KEY, &index.to_le_bytes())?;
        self.applied_index.store(index, Ordering::Release);
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.first_index.load(Ordering::Acquire)
    }

    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }
}
