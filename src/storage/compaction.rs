//! Background compaction and garbage collection.
//!
//! One task drives both retention mechanisms:
//! - index-store compaction through [`KvControl::compaction_task`]
//! - GC of the transaction column families and the raw KV column family,
//!   at a safe point trailing the oracle by a fixed physical lag
//!
//! Failures are logged and retried on the next tick; they never stop the task.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::kv::KvControl;
use crate::storage::RawKvWriter;
use crate::tso::{TimestampOracle, LOGICAL_BITS};
use crate::txn::TxnEngine;

/// Compaction strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionMode {
    /// Compact the index store every `compaction`, collect garbage every `gc`.
    Periodic { compaction: Duration, gc: Duration },

    /// One pass of each, then exit.
    Once,
}

/// What one pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub kv_compacted: usize,
    pub txn_removed: usize,
    pub raw_removed: usize,
}

pub struct Compactor {
    kv: Arc<KvControl>,
    txn: Arc<TxnEngine>,
    raw: Arc<RawKvWriter>,
    tso: Arc<dyn TimestampOracle>,
    /// Physical milliseconds the GC safe point trails the oracle.
    safe_point_lag_ms: i64,
    mode: CompactionMode,
}

impl Compactor {
    pub fn new(
        kv: Arc<KvControl>,
        txn: Arc<TxnEngine>,
        raw: Arc<RawKvWriter>,
        tso: Arc<dyn TimestampOracle>,
        safe_point_lag_ms: i64,
        mode: CompactionMode,
    ) -> Self {
        Self {
            kv,
            txn,
            raw,
            tso,
            safe_point_lag_ms,
            mode,
        }
    }

    /// GC safe point, or `None` while the oracle is unavailable.
    pub fn safe_point(&self) -> Option<i64> {
        match self.tso.get_ts() {
            0 => None,
            ts => Some(ts - (self.safe_point_lag_ms << LOGICAL_BITS)).filter(|sp| *sp > 0),
        }
    }

    /// Spawns the background task.
    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic { compaction, gc } => self.run_periodic(compaction, gc).await,
                CompactionMode::Once => {
                    self.compact_once();
                    self.gc_once();
                }
            }
        })
    }

    async fn run_periodic(&self, compaction_every: Duration, gc_every: Duration) {
        info!(?compaction_every, ?gc_every, "Starting periodic compactor");
        let mut compaction_ticker = interval(compaction_every);
        let mut gc_ticker = interval(gc_every);
        compaction_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        gc_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = compaction_ticker.tick() => {
                    self.compact_once();
                }
                _ = gc_ticker.tick() => {
                    self.gc_once();
                }
            }
        }
    }

    /// Runs index-store compaction; returns the number of keys compacted.
    pub fn compact_once(&self) -> usize {
        match self.kv.compaction_task() {
            Ok(0) => {
                debug!("Index compaction had nothing to do");
                0
            }
            Ok(compacted) => {
                info!(compacted, compact_revision = self.kv.compact_revision(), "Index compaction completed");
                compacted
            }
            Err(e) => {
                warn!(error = %e, "Index compaction failed");
                0
            }
        }
    }

    /// Runs GC over the transaction and raw KV column families.
    pub fn gc_once(&self) -> CompactionStats {
        let mut stats = CompactionStats::default();
        let Some(safe_point) = self.safe_point() else {
            warn!("TSO unavailable, skipping GC");
            return stats;
        };

        match self.txn.gc(safe_point) {
            Ok(removed) => stats.txn_removed = removed,
            Err(e) => warn!(safe_point, error = %e, "Txn GC failed"),
        }
        match self.raw.gc(safe_point) {
            Ok(removed) => stats.raw_removed = removed,
            Err(e) => warn!(safe_point, error = %e, "Raw KV GC failed"),
        }
        debug!(safe_point, ?stats, "GC pass finished");
        stats
    }

    /// One full pass of both mechanisms.
    pub fn run_once(&self) -> CompactionStats {
        let kv_compacted = self.compact_once();
        CompactionStats {
            kv_compacted,
            ..self.gc_once()
        }
    }
}
