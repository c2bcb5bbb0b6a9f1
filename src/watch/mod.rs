//! One-time watches on index-store keys.
//!
//! A watcher registers for a single key and fires on the next applied put or
//! delete of that key, then is gone. Dispatch runs synchronously on the apply
//! path, in apply order. Each callback runs isolated: a panicking callback is
//! logged and the remaining watchers still fire.
//!
//! Callbacks should be cheap. Consumers that need to do real work use
//! [`WatchHub::watch_once`], which hands the event to a crossbeam channel.

use crossbeam_channel::{bounded, Receiver};
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::kv::Kv;

/// Watch-related errors.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Watch not found: {0}")]
    WatchNotFound(i64),

    #[error("Invalid watch configuration: {0}")]
    InvalidConfig(String),
}

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// Delivered to a watcher when its key changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: Kv,
    /// The version that was live before the change, if any.
    pub prev_kv: Option<Kv>,
}

pub type WatchCallback = Box<dyn FnOnce(WatchEvent) + Send + Sync + 'static>;

/// Registry of pending one-time watchers.
pub struct WatchHub {
    /// key -> pending watchers, in registration order
    by_key: DashMap<Vec<u8>, Vec<(i64, WatchCallback)>>,

    /// watch_id -> key, for cancellation
    by_id: DashMap<i64, Vec<u8>>,

    next_watch_id: AtomicI64,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchHub {
            by_key: DashMap::new(),
            by_id: DashMap::new(),
            next_watch_id: AtomicI64::new(1),
        })
    }

    /// Registers `callback` to run once on the next put or delete of `key`.
    pub fn register_one_time_watch<F>(&self, key: Vec<u8>, callback: F) -> WatchResult<i64>
    where
        F: FnOnce(WatchEvent) + Send + Sync + 'static,
    {
        if key.is_empty() {
            return Err(WatchError::InvalidConfig("Watch key cannot be empty".to_string()));
        }

        let watch_id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        self.by_id.insert(watch_id, key.clone());
        self.by_key
            .entry(key)
            .or_default()
            .push((watch_id, Box::new(callback)));

        debug!(watch_id, "One-time watch registered");
        Ok(watch_id)
    }

    /// Channel form of [`WatchHub::register_one_time_watch`].
    pub fn watch_once(&self, key: Vec<u8>) -> WatchResult<(i64, Receiver<WatchEvent>)> {
        let (tx, rx) = bounded(1);
        let watch_id = self.register_one_time_watch(key, move |event| {
            if tx.send(event).is_err() {
                debug!("One-time watch receiver dropped before delivery");
            }
        })?;
        Ok((watch_id, rx))
    }

    pub fn cancel(&self, watch_id: i64) -> WatchResult<()> {
        let Some((_, key)) = self.by_id.remove(&watch_id) else {
            return Err(WatchError::WatchNotFound(watch_id));
        };

        let now_empty = match self.by_key.get_mut(&key) {
            Some(mut pending) => {
                pending.retain(|(id, _)| *id != watch_id);
                pending.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_key.remove_if(&key, |_, pending| pending.is_empty());
        }

        debug!(watch_id, "One-time watch canceled");
        Ok(())
    }

    /// Fires and removes every watcher registered on `key`.
    ///
    /// Returns how many callbacks completed without panicking.
    pub fn trigger(&self, key: &[u8], event: &WatchEvent) -> usize {
        // Detach the batch first so callbacks may register new watches.
        let Some((_, pending)) = self.by_key.remove(key) else {
            return 0;
        };

        let mut delivered = 0;
        for (watch_id, callback) in pending {
            self.by_id.remove(&watch_id);
            let event = event.clone();
            match catch_unwind(AssertUnwindSafe(move || callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(watch_id, "One-time watch callback panicked"),
            }
        }

        debug!(delivered, event_type = ?event.event_type, "One-time watches fired");
        delivered
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn watcher_count(&self) -> usize {
        self.by_id.len()
    }
}
