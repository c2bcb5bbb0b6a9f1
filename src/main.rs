//! txnkv server entry point.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use txnkv::server::{BackendKind, Node, ServerConfig};

/// A transactional MVCC engine and revisioned metadata store.
#[derive(Parser, Debug)]
#[command(name = "txnkv", version, about = "Transactional MVCC engine and revisioned metadata store")]
struct Args {
    /// Directory holding the persistent backend.
    #[arg(long, default_value = "default.txnkv")]
    data_dir: String,

    /// Storage backend - 'sled' or 'memory'.
    #[arg(long, default_value = "sled")]
    backend: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256)]
    cache_size_mb: u64,

    /// Largest accepted index-store key, in bytes.
    #[arg(long, default_value_t = 4096)]
    max_key_size: usize,

    /// Largest accepted index-store value, in bytes.
    #[arg(long, default_value_t = 8192)]
    max_value_size: usize,

    /// Compact index-store history in the background.
    #[arg(long, default_value_t = false)]
    auto_compaction: bool,

    /// Revisions kept behind the current one when compacting.
    #[arg(long, default_value_t = 1000)]
    compaction_retention: i64,

    /// Seconds between index-store compactions.
    #[arg(long, default_value_t = 300)]
    compaction_interval_secs: u64,

    /// Seconds between GC passes over txn and raw KV data.
    #[arg(long, default_value_t = 600)]
    gc_interval_secs: u64,

    /// How far the GC safe point trails the oracle, in milliseconds.
    #[arg(long, default_value_t = 600_000)]
    gc_safe_point_lag_ms: i64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_server_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        backend = ?config.backend,
        auto_compaction = config.auto_compaction,
        "Starting txnkv"
    );

    let node = Node::open(config)?;
    let shutdown = setup_signal_handlers();

    match node.run(shutdown).await {
        Ok(()) => {
            info!("Node shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Node error: {:?}", e);
            Err(e)
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn build_server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let config = ServerConfig {
        data_dir: PathBuf::from(&args.data_dir),
        backend: BackendKind::from_str(&args.backend)?,
        cache_size_mb: args.cache_size_mb,
        max_key_size: args.max_key_size,
        max_value_size: args.max_value_size,
        auto_compaction: args.auto_compaction,
        compaction_retention_rev_count: args.compaction_retention,
        compaction_interval: Duration::from_secs(args.compaction_interval_secs),
        gc_interval: Duration::from_secs(args.gc_interval_secs),
        gc_safe_point_lag_ms: args.gc_safe_point_lag_ms,
        ..Default::default()
    };
    config.validate()?;
    Ok(config)
}

/// Resolves on SIGTERM or SIGINT.
async fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to wait for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
        _ = sigint.recv() => info!("Received SIGINT signal"),
    }
}
