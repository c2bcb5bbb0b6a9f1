//! Node assembly: opens the backend and wires every subsystem onto it.
//!
//! Startup order matters:
//! 1. storage backend (sled or in-memory)
//! 2. lease manager and index store, with the store recovered from disk
//! 3. local consensus, which replays unapplied log entries through the
//!    [`StateMachine`] and therefore needs the recovered store
//! 4. request-facing components (index control, txn engine, raw writer)
//! 5. background tasks: lease expiry, compaction/GC, log trimming

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::consensus::{ApplyHandler, ApplyOutcome, Command, ConsensusError, ConsensusResult, LocalConsensus};
use crate::kv::{KvControl, KvControlConfig, KvStore};
use crate::lease::{LeaseExpireEvent, LeaseManager};
use crate::storage::backend::{BackendConfig, MemoryEngine, RawEngine, SledEngine};
use crate::storage::{CompactionMode, Compactor, RawKvWriter};
use crate::tso::{LocalTso, TimestampOracle};
use crate::txn::TxnEngine;
use crate::watch::WatchHub;

/// Capacity of the lease expiry channel.
const LEASE_EXPIRY_QUEUE: usize = 1024;

/// Which storage engine backs the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Persistent sled database under `data_dir`.
    Sled,
    /// Process-local maps; nothing survives a restart.
    Memory,
}

impl BackendKind {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "sled" => Ok(BackendKind::Sled),
            "memory" => Ok(BackendKind::Memory),
            _ => Err(anyhow::anyhow!("Invalid backend: {}. Must be 'sled' or 'memory'", s)),
        }
    }
}

/// Node configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Data directory of the sled backend.
    pub data_dir: PathBuf,

    pub backend: BackendKind,

    /// Backend page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often the backend flushes to disk.
    pub flush_interval_ms: u64,

    /// Largest accepted index-store key, in bytes.
    pub max_key_size: usize,

    /// Largest accepted index-store value, in bytes.
    pub max_value_size: usize,

    /// Run index-store compaction in the background.
    pub auto_compaction: bool,

    /// Revisions kept behind the current one by background compaction.
    pub compaction_retention_rev_count: i64,

    /// Keys per compaction command.
    pub compaction_batch_size: usize,

    pub compaction_interval: Duration,

    /// How often the txn and raw KV column families are collected.
    pub gc_interval: Duration,

    /// How far, in physical milliseconds, the GC safe point trails the oracle.
    pub gc_safe_point_lag_ms: i64,

    /// How often leases are checked for expiry.
    pub lease_check_interval: Duration,

    /// Applied command-log entries kept when the log is trimmed.
    pub log_retention_entries: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let kv = KvControlConfig::default();
        Self {
            data_dir: PathBuf::from("default.txnkv"),
            backend: BackendKind::Sled,
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            max_key_size: kv.max_key_size,
            max_value_size: kv.max_value_size,
            auto_compaction: kv.auto_compaction,
            compaction_retention_rev_count: kv.compaction_retention_rev_count,
            compaction_batch_size: kv.compaction_batch_size,
            compaction_interval: Duration::from_secs(300),
            gc_interval: Duration::from_secs(600),
            gc_safe_point_lag_ms: 10 * 60 * 1000,
            lease_check_interval: Duration::from_millis(500),
            log_retention_entries: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_key_size > 0, "max_key_size must be positive");
        anyhow::ensure!(self.max_value_size > 0, "max_value_size must be positive");
        anyhow::ensure!(
            self.compaction_retention_rev_count >= 0,
            "compaction_retention_rev_count must not be negative, got {}",
            self.compaction_retention_rev_count
        );
        anyhow::ensure!(self.compaction_batch_size > 0, "compaction_batch_size must be positive");
        anyhow::ensure!(
            self.gc_safe_point_lag_ms >= 0,
            "gc_safe_point_lag_ms must not be negative, got {}",
            self.gc_safe_point_lag_ms
        );
        for (name, interval) in [
            ("compaction_interval", self.compaction_interval),
            ("gc_interval", self.gc_interval),
            ("lease_check_interval", self.lease_check_interval),
        ] {
            anyhow::ensure!(!interval.is_zero(), "{} must be non-zero", name);
        }
        Ok(())
    }

    pub fn kv_control_config(&self) -> KvControlConfig {
        KvControlConfig {
            max_key_size: self.max_key_size,
            max_value_size: self.max_value_size,
            auto_compaction: self.auto_compaction,
            compaction_retention_rev_count: self.compaction_retention_rev_count,
            compaction_batch_size: self.compaction_batch_size,
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            data_dir: self.data_dir.clone(),
            cache_size_mb: self.cache_size_mb,
            flush_interval_ms: self.flush_interval_ms,
        }
    }
}

/// Applies committed commands: raw batches go straight to the engine, index
/// increments go through the index store and fire watches for what changed.
pub struct StateMachine {
    engine: Arc<dyn RawEngine>,
    kv_store: Arc<KvStore>,
    watch_hub: Arc<WatchHub>,
}

impl StateMachine {
    pub fn new(engine: Arc<dyn RawEngine>, kv_store: Arc<KvStore>, watch_hub: Arc<WatchHub>) -> Self {
        Self {
            engine,
            kv_store,
            watch_hub,
        }
    }
}

impl ApplyHandler for StateMachine {
    fn apply(&self, index: u64, command: &Command) -> ConsensusResult<ApplyOutcome> {
        match command {
            Command::Write(batch) => {
                self.engine.write(batch.clone())?;
                Ok(ApplyOutcome::default())
            }
            Command::KvIndex(increments) => {
                let report = self
                    .kv_store
                    .apply(increments)
                    .map_err(|e| ConsensusError::Kv(Box::new(e)))?;

                let mut fired = 0;
                for applied in &report.events {
                    fired += self.watch_hub.trigger(&applied.key, &applied.event);
                }
                if fired > 0 {
                    debug!(index, fired, "Watches fired");
                }
                Ok(ApplyOutcome {
                    warnings: report.warnings,
                })
            }
        }
    }
}

/// A single-partition node with every subsystem attached.
pub struct Node {
    config: ServerConfig,
    engine: Arc<dyn RawEngine>,
    consensus: Arc<LocalConsensus>,
    tso: Arc<dyn TimestampOracle>,
    leases: Arc<LeaseManager>,
    kv_store: Arc<KvStore>,
    kv: Arc<KvControl>,
    txn: Arc<TxnEngine>,
    raw: Arc<RawKvWriter>,
    watch_hub: Arc<WatchHub>,
    expire_rx: Option<mpsc::Receiver<LeaseExpireEvent>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Opens a node backed by the local hybrid-clock oracle.
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        Self::with_oracle(config, Arc::new(LocalTso::new()))
    }

    /// Opens a node that takes timestamps from `tso`.
    pub fn with_oracle(config: ServerConfig, tso: Arc<dyn TimestampOracle>) -> anyhow::Result<Self> {
        config.validate()?;
        info!(data_dir = %config.data_dir.display(), backend = ?config.backend, "Opening node");

        // 1. Storage backend
        let engine: Arc<dyn RawEngine> = match config.backend {
            BackendKind::Sled => SledEngine::open(&config.backend_config())?,
            BackendKind::Memory => MemoryEngine::new(),
        };
        info!(engine = engine.name(), "Backend storage initialized");

        // 2. Leases and the index store
        let (expire_tx, expire_rx) = mpsc::channel(LEASE_EXPIRY_QUEUE);
        let leases = Arc::new(LeaseManager::new(expire_tx));
        let kv_store = Arc::new(KvStore::new(engine.clone(), leases.clone()));
        kv_store.recover()?;
        info!(
            revision = kv_store.current_revision(),
            compact_revision = kv_store.compact_revision(),
            "Index store recovered"
        );

        // 3. Consensus, replaying whatever the last run left unapplied
        let watch_hub = WatchHub::new();
        let state_machine = Arc::new(StateMachine::new(engine.clone(), kv_store.clone(), watch_hub.clone()));
        let consensus = LocalConsensus::open(engine.clone(), state_machine)?;
        info!(applied_index = consensus.applied_index(), "Consensus initialized");

        // 4. Request-facing components
        let kv = Arc::new(KvControl::new(
            config.kv_control_config(),
            kv_store.reader(),
            leases.clone(),
            consensus.clone(),
        ));
        let txn = Arc::new(TxnEngine::new(engine.clone(), consensus.clone(), tso.clone()));
        let raw = Arc::new(RawKvWriter::new(engine.clone(), consensus.clone(), tso.clone()));

        info!("Node initialization complete");
        Ok(Self {
            config,
            engine,
            consensus,
            tso,
            leases,
            kv_store,
            kv,
            txn,
            raw,
            watch_hub,
            expire_rx: Some(expire_rx),
            background_tasks: Vec::new(),
        })
    }

    /// Spawns the background tasks. Must be called inside a tokio runtime;
    /// calling it twice is a no-op.
    pub fn start(&mut self) {
        let Some(expire_rx) = self.expire_rx.take() else {
            warn!("Background tasks already started");
            return;
        };

        let leases = self.leases.clone();
        let tick = self.config.lease_check_interval;
        self.background_tasks
            .push(tokio::spawn(async move { leases.run_expiry_loop(tick).await }));

        let kv = self.kv.clone();
        self.background_tasks
            .push(tokio::spawn(async move { process_lease_expiries(expire_rx, kv).await }));

        let compactor = Compactor::new(
            self.kv.clone(),
            self.txn.clone(),
            self.raw.clone(),
            self.tso.clone(),
            self.config.gc_safe_point_lag_ms,
            CompactionMode::Periodic {
                compaction: self.config.compaction_interval,
                gc: self.config.gc_interval,
            },
        );
        self.background_tasks.push(compactor.run());

        let consensus = self.consensus.clone();
        let every = self.config.compaction_interval;
        let keep = self.config.log_retention_entries;
        self.background_tasks
            .push(tokio::spawn(async move { trim_command_log(consensus, every, keep).await }));

        info!(tasks = self.background_tasks.len(), "Background tasks started");
    }

    /// Starts the background tasks and runs until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        self.start();
        info!(
            revision = self.kv.current_revision(),
            applied_index = self.consensus.applied_index(),
            "Node running"
        );
        shutdown.await;
        info!("Node shutting down");
        self.shutdown()
    }

    /// Stops the background tasks and flushes the backend.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        self.engine.flush()?;
        info!("Backend flushed");
        Ok(())
    }

    pub fn kv(&self) -> Arc<KvControl> {
        self.kv.clone()
    }

    pub fn txn(&self) -> Arc<TxnEngine> {
        self.txn.clone()
    }

    pub fn raw(&self) -> Arc<RawKvWriter> {
        self.raw.clone()
    }

    pub fn leases(&self) -> Arc<LeaseManager> {
        self.leases.clone()
    }

    pub fn watch_hub(&self) -> Arc<WatchHub> {
        self.watch_hub.clone()
    }

    pub fn kv_store(&self) -> Arc<KvStore> {
        self.kv_store.clone()
    }

    pub fn consensus(&self) -> Arc<LocalConsensus> {
        self.consensus.clone()
    }

    pub fn tso(&self) -> Arc<dyn TimestampOracle> {
        self.tso.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.background_tasks {
            task.abort();
        }
    }
}

/// Deletes the keys of every expired lease through the index store.
async fn process_lease_expiries(mut expire_rx: mpsc::Receiver<LeaseExpireEvent>, kv: Arc<KvControl>) {
    while let Some(event) = expire_rx.recv().await {
        if event.keys.is_empty() {
            debug!(lease_id = event.lease_id, "Expired lease had no keys");
            continue;
        }
        match kv.delete_keys(&event.keys) {
            Ok(resp) => info!(
                lease_id = event.lease_id,
                deleted = resp.deleted,
                revision = resp.revision,
                "Deleted keys of expired lease"
            ),
            Err(e) => error!(lease_id = event.lease_id, error = %e, "Failed to delete keys of expired lease"),
        }
    }
    debug!("Lease expiry channel closed");
}

async fn trim_command_log(consensus: Arc<LocalConsensus>, every: Duration, keep: u64) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = consensus.compact_log(keep) {
            warn!(error = %e, "Command log trim failed");
        }
    }
}
