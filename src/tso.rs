//! Timestamp oracles.
//!
//! Timestamps are hybrid: `physical_ms << 18 | logical`. A return value of 0
//! means the oracle is unavailable; writers must refuse the request instead of
//! inventing a timestamp.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::storage::mvcc::now_ms;

/// Bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

pub fn compose_ts(physical_ms: i64, logical: i64) -> i64 {
    (physical_ms << LOGICAL_BITS) | logical
}

pub fn physical_ms(ts: i64) -> i64 {
    ts >> LOGICAL_BITS
}

/// Supplies strictly increasing timestamps.
pub trait TimestampOracle: Send + Sync {
    /// Next timestamp, or 0 when unavailable.
    fn get_ts(&self) -> i64;
}

/// Local hybrid-clock oracle for single-node deployments.
pub struct LocalTso {
    last: AtomicI64,
}

impl LocalTso {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Default for LocalTso {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampOracle for LocalTso {
    fn get_ts(&self) -> i64 {
        let floor = compose_ts(now_ms(), 0);
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = floor.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Counter oracle whose value and availability tests control directly.
pub struct ManualTso {
    counter: AtomicI64,
    available: AtomicBool,
}

impl ManualTso {
    pub fn new(initial: i64) -> Self {
        Self {
            counter: AtomicI64::new(initial),
            available: AtomicBool::new(true),
        }
    }

    pub fn set(&self, ts: i64) {
        self.counter.store(ts, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl TimestampOracle for ManualTso {
    fn get_ts(&self) -> i64 {
        if !self.available.load(Ordering::SeqCst) {
            return 0;
        }
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}
