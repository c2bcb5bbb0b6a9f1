//! # txnkv: a transactional MVCC engine and revisioned metadata store
//!
//! txnkv keeps three kinds of data on one storage engine, all written through
//! a single consensus log:
//!
//! - **Transactions**: Percolator-style two-phase commit (optimistic and
//!   pessimistic) over the `lock`, `write` and `data` column families
//! - **Raw KV**: timestamped versioned writes with TTL, put-if-absent and
//!   compare-and-set
//! - **Index store**: etcd-like revisioned keys with generations, leases,
//!   one-time watches and compaction
//!
//! A background compactor trims index-store history and garbage-collects
//! versions older than a safe point derived from the timestamp oracle.
//!
//! # Usage
//!
//! ```bash
//! txnkv --data-dir /var/lib/txnkv --auto-compaction --gc-interval-secs 300
//! ```

pub mod consensus;
pub mod kv;
pub mod lease;
pub mod server;
pub mod storage;
pub mod tso;
pub mod txn;
pub mod watch;

pub use kv::{KvControl, KvStore};
pub use lease::LeaseManager;
pub use server::{Node, ServerConfig};
pub use storage::{RawEngine, RawKvWriter};
pub use tso::TimestampOracle;
pub use txn::TxnEngine;
pub use watch::WatchHub;
