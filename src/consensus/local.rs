use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    ApplyHandler, ApplyOutcome, Command, CommandLog, ConsensusEngine, ConsensusError, ConsensusResult, LogEntry,
};
use crate::storage::backend::RawEngine;

const TERM: u64 = 1;

/// Single-node consensus: log, then apply, one command at a time.
///
/// The apply mutex is the partition's single-writer latch. Entries that were
/// logged but not applied before a crash are replayed by [`LocalConsensus::open`].
pub struct LocalConsensus {
    log: CommandLog,
    handler: Arc<dyn ApplyHandler>,
    apply_lock: Mutex<()>,
}

impl LocalConsensus {
    /// Opens the command log and replays entries past the applied index.
    pub fn open(engine: Arc<dyn RawEngine>, handler: Arc<dyn ApplyHandler>) -> ConsensusResult<Arc<Self>> {
        let log = CommandLog::new(engine)?;
        let consensus = Self {
            log,
            handler,
            apply_lock: Mutex::new(()),
        };

        let pending = consensus.log.entries_from(consensus.log.applied_index() + 1)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Replaying unapplied log entries");
        }
        for entry in pending {
            if let Err(e) = consensus.handler.apply(entry.index, &entry.command) {
                warn!(index = entry.index, error = %e, "Replayed entry was rejected");
            }
            consensus.log.save_applied(entry.index)?;
        }

        Ok(Arc::new(consensus))
    }

    pub fn applied_index(&self) -> u64 {
        self.log.applied_index()
    }

    pub fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    /// Trims applied entries, keeping the newest `keep` of them.
    pub fn compact_log(&self, keep: u64) -> ConsensusResult<()> {
        let _guard = self.apply_lock.lock();
        let applied = self.log.applied_index();
        if applied > keep {
            self.log.truncate_before(applied - keep + 1)?;
            debug!(first_index = self.log.first_index(), "Command log trimmed");
        }
        Ok(())
    }
}

impl ConsensusEngine for LocalConsensus {
    fn submit_sync(&self, command: Command) -> ConsensusResult<ApplyOutcome> {
        let _guard = self.apply_lock.lock();

        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: TERM,
            command,
        };
        self.log.append(&entry)?;

        let result = self.handler.apply(entry.index, &entry.command);
        match &result {
            // Storage failures leave the entry unapplied so it is replayed.
            Err(ConsensusError::Backend(e)) => {
                error!(index = entry.index, error = %e, "Apply failed on storage");
                return result;
            }
            Err(e) => {
                debug!(index = entry.index, kind = entry.command.kind(), error = %e, "Command rejected at apply");
            }
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(index = entry.index, warning = %warning, "Command applied with warning");
                }
            }
        }
        self.log.save_applied(entry.index)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{MemoryEngine, WriteBatch};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail_on: AtomicU64,
    }

    impl ApplyHandler for Recorder {
        fn apply(&self, index: u64, _command: &Command) -> ConsensusResult<ApplyOutcome> {
            if self.fail_on.load(Ordering::SeqCst) == index {
                return Err(ConsensusError::Apply("boom".to_string()));
            }
            self.seen.lock().push(index);
            Ok(ApplyOutcome::default())
        }
    }

    fn command() -> Command {
        let mut batch = WriteBatch::new();
        batch.put("default", b"k".to_vec(), b"v".to_vec());
        Command::Write(batch)
    }

    #[test]
    fn test_submit_applies_in_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: AtomicU64::new(0),
        });
        let consensus = LocalConsensus::open(MemoryEngine::new(), recorder.clone()).unwrap();

        for _ in 0..3 {
            consensus.submit_sync(command()).unwrap();
        }
        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);
        assert_eq!(consensus.applied_index(), 3);
    }

    #[test]
    fn test_rejected_command_still_advances() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: AtomicU64::new(2),
        });
        let consensus = LocalConsensus::open(MemoryEngine::new(), recorder.clone()).unwrap();

        consensus.submit_sync(command()).unwrap();
        assert!(consensus.submit_sync(command()).is_err());
        consensus.submit_sync(command()).unwrap();

        assert_eq!(*recorder.seen.lock(), vec![1, 3]);
        assert_eq!(consensus.applied_index(), 3);
    }

    #[test]
    fn test_replays_unapplied_entries() {
        let engine = MemoryEngine::new();
        {
            let log = CommandLog::new(engine.clone()).unwrap();
            log.append(&LogEntry { index: 1, term: 1, command: command() }).unwrap();
            log.append(&LogEntry { index: 2, term: 1, command: command() }).unwrap();
            log.save_applied(1).unwrap();
        }

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: AtomicU64::new(0),
        });
        let consensus = LocalConsensus::open(engine, recorder.clone()).unwrap();
        assert_eq!(*recorder.seen.lock(), vec![2]);
        assert_eq!(consensus.applied_index(), 2);

        consensus.compact_log(1).unwrap();
        consensus.submit_sync(command()).unwrap();
        assert_eq!(consensus.last_index(), 3);
    }
}
