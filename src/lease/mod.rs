//! Leases that bound the lifetime of index-store keys.
//!
//! Keys put with a lease are attached to it; when the lease is revoked or
//! expires, the attached keys are handed back so the owner can delete them.
//! Expiry is tracked with a min-heap of deadlines drained by
//! [`LeaseManager::run_expiry_loop`]; renewals push a fresh deadline and stale
//! heap entries are skipped when popped.

use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lease-related errors.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Lease already exists: {0}")]
    LeaseAlreadyExists(i64),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(i64),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

struct Lease {
    granted_ttl: i64,
    expires_at: Instant,
    keys: BTreeSet<Vec<u8>>,
}

impl Lease {
    fn remaining_ttl(&self, now: Instant) -> i64 {
        self.expires_at.saturating_duration_since(now).as_secs() as i64
    }
}

/// Snapshot of one lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseInfo {
    pub id: i64,
    /// Seconds.
    pub granted_ttl: i64,
    /// Seconds left, rounded down.
    pub remaining_ttl: i64,
    /// Empty unless requested.
    pub keys: Vec<Vec<u8>>,
}

/// Sent when a lease runs out; `keys` were attached at expiry.
#[derive(Debug, Clone)]
pub struct LeaseExpireEvent {
    pub lease_id: i64,
    pub keys: Vec<Vec<u8>>,
}

pub struct LeaseManager {
    leases: RwLock<HashMap<i64, Lease>>,
    next_lease_id: AtomicI64,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, i64)>>>,
    expire_tx: mpsc::Sender<LeaseExpireEvent>,
}

impl LeaseManager {
    pub fn new(expire_tx: mpsc::Sender<LeaseExpireEvent>) -> Self {
        LeaseManager {
            leases: RwLock::new(HashMap::new()),
            next_lease_id: AtomicI64::new(1),
            deadlines: Mutex::new(BinaryHeap::new()),
            expire_tx,
        }
    }

    /// Grants a lease of `ttl` seconds. `id == 0` picks a fresh id.
    pub fn grant(&self, id: i64, ttl: i64) -> LeaseResult<LeaseInfo> {
        if ttl <= 0 {
            return Err(LeaseError::InvalidTtl(ttl));
        }

        let mut leases = self.leases.write();
        let lease_id = if id == 0 {
            loop {
                let candidate = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
                if !leases.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            id
        };
        if leases.contains_key(&lease_id) {
            return Err(LeaseError::LeaseAlreadyExists(lease_id));
        }

        let expires_at = Instant::now() + Duration::from_secs(ttl as u64);
        leases.insert(
            lease_id,
            Lease {
                granted_ttl: ttl,
                expires_at,
                keys: BTreeSet::new(),
            },
        );
        drop(leases);
        self.deadlines.lock().push(Reverse((expires_at, lease_id)));

        debug!(lease_id, ttl, "Lease granted");
        Ok(LeaseInfo {
            id: lease_id,
            granted_ttl: ttl,
            remaining_ttl: ttl,
            keys: Vec::new(),
        })
    }

    /// Removes a lease and returns its attached keys.
    pub fn revoke(&self, id: i64) -> LeaseResult<Vec<Vec<u8>>> {
        let lease = self.leases.write().remove(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        debug!(lease_id = id, key_count = lease.keys.len(), "Lease revoked");
        Ok(lease.keys.into_iter().collect())
    }

    /// Restarts the lease's clock at its granted TTL.
    pub fn renew(&self, id: i64) -> LeaseResult<i64> {
        let (expires_at, ttl) = {
            let mut leases = self.leases.write();
            let lease = leases.get_mut(&id).ok_or(LeaseError::LeaseNotFound(id))?;
            lease.expires_at = Instant::now() + Duration::from_secs(lease.granted_ttl as u64);
            (lease.expires_at, lease.granted_ttl)
        };
        self.deadlines.lock().push(Reverse((expires_at, id)));

        debug!(lease_id = id, ttl, "Lease renewed");
        Ok(ttl)
    }

    pub fn exists(&self, id: i64) -> bool {
        self.leases.read().contains_key(&id)
    }

    pub fn attach_keys<I>(&self, id: i64, keys: I) -> LeaseResult<()>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut leases = self.leases.write();
        let lease = leases.get_mut(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        lease.keys.extend(keys);
        Ok(())
    }

    /// Detaches keys grouped by lease. Unknown leases are skipped.
    pub fn detach_keys(&self, keys_by_lease: &HashMap<i64, Vec<Vec<u8>>>) {
        let mut leases = self.leases.write();
        for (id, keys) in keys_by_lease {
            if let Some(lease) = leases.get_mut(id) {
                for key in keys {
                    lease.keys.remove(key);
                }
            }
        }
    }

    pub fn query(&self, id: i64, with_keys: bool) -> LeaseResult<LeaseInfo> {
        let leases = self.leases.read();
        let lease = leases.get(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        Ok(LeaseInfo {
            id,
            granted_ttl: lease.granted_ttl,
            remaining_ttl: lease.remaining_ttl(Instant::now()),
            keys: if with_keys {
                lease.keys.iter().cloned().collect()
            } else {
                Vec::new()
            },
        })
    }

    pub fn list(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.leases.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn count(&self) -> usize {
        self.leases.read().len()
    }

    /// Removes every lease whose deadline passed by `now`.
    ///
    /// The deadline heap and the lease map are never held together; grant
    /// and renew take them in the opposite order.
    fn take_expired(&self, now: Instant) -> Vec<LeaseExpireEvent> {
        let mut due_ids = Vec::new();
        {
            let mut deadlines = self.deadlines.lock();
            while let Some(Reverse((deadline, lease_id))) = deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                deadlines.pop();
                due_ids.push(lease_id);
            }
        }
        if due_ids.is_empty() {
            return Vec::new();
        }

        let mut expired = Vec::new();
        let mut leases = self.leases.write();
        for lease_id in due_ids {
            // Renewed or revoked leases leave stale deadlines behind.
            let due = leases.get(&lease_id).map_or(false, |l| l.expires_at <= now);
            if !due {
                continue;
            }
            if let Some(lease) = leases.remove(&lease_id) {
                expired.push(LeaseExpireEvent {
                    lease_id,
                    keys: lease.keys.into_iter().collect(),
                });
            }
        }
        expired
    }

    /// Polls for expired leases every `tick` and reports them on the expire
    /// channel. Returns when the channel's receiver is gone.
    pub async fn run_expiry_loop(self: Arc<Self>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            for event in self.take_expired(Instant::now()) {
                info!(lease_id = event.lease_id, key_count = event.keys.len(), "Lease expired");
                if let Err(e) = self.expire_tx.send(event).await {
                    warn!(error = ?e, "Lease expiry receiver closed, stopping expiry loop");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<LeaseManager>, mpsc::Receiver<LeaseExpireEvent>) {
        let (tx, rx) = mpsc::channel(10);
        (Arc::new(LeaseManager::new(tx)), rx)
    }

    #[test]
    fn test_grant_and_revoke() {
        let (manager, _rx) = manager();

        let lease = manager.grant(0, 30).unwrap();
        assert!(lease.id > 0);
        assert_eq!(lease.granted_ttl, 30);
        assert!(manager.exists(lease.id));
        assert!(matches!(manager.grant(lease.id, 5), Err(LeaseError::LeaseAlreadyExists(_))));
        assert!(matches!(manager.grant(0, 0), Err(LeaseError::InvalidTtl(0))));

        assert!(manager.revoke(lease.id).unwrap().is_empty());
        assert!(!manager.exists(lease.id));
        assert!(matches!(manager.revoke(lease.id), Err(LeaseError::LeaseNotFound(_))));
    }

    #[test]
    fn test_attach_detach_query() {
        let (manager, _rx) = manager();
        let lease = manager.grant(42, 30).unwrap();

        manager
            .attach_keys(lease.id, vec![b"key1".to_vec(), b"key2".to_vec()])
            .unwrap();
        assert_eq!(manager.query(42, true).unwrap().keys.len(), 2);
        assert!(manager.query(42, false).unwrap().keys.is_empty());

        let mut detach = HashMap::new();
        detach.insert(42, vec![b"key1".to_vec()]);
        detach.insert(99, vec![b"other".to_vec()]);
        manager.detach_keys(&detach);
        assert_eq!(manager.query(42, true).unwrap().keys, vec![b"key2".to_vec()]);

        assert!(matches!(
            manager.attach_keys(99, vec![b"k".to_vec()]),
            Err(LeaseError::LeaseNotFound(99))
        ));
    }

    #[test]
    fn test_take_expired_skips_renewed() {
        let (manager, _rx) = manager();
        let lease = manager.grant(0, 1).unwrap();
        manager.attach_keys(lease.id, vec![b"k".to_vec()]).unwrap();

        let later = Instant::now() + Duration::from_secs(2);
        let expired = manager.take_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].keys, vec![b"k".to_vec()]);
        assert_eq!(manager.count(), 0);

        let lease = manager.grant(0, 10).unwrap();
        manager.renew(lease.id).unwrap();
        assert!(manager.take_expired(Instant::now()).is_empty());
        assert!(manager.exists(lease.id));
    }

    #[test]
    fn test_expiry_races_grant_and_renew() {
        let (manager, _rx) = manager();
        let ids: Vec<i64> = (1..=64).map(|i| manager.grant(i, 30).unwrap().id).collect();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let expirer = {
            let manager = manager.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut expired = 0;
                while !stop.load(Ordering::Relaxed) {
                    expired += manager.take_expired(Instant::now() + Duration::from_secs(3600)).len();
                    let _ = manager.grant(0, 1);
                }
                expired
            })
        };
        let client = {
            let manager = manager.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for id in &ids {
                        let _ = manager.renew(*id);
                        let _ = manager.grant(*id, 30);
                        let _ = manager.revoke(*id + 1000);
                    }
                }
            })
        };

        std::thread::sleep(Duration::from_millis(500));
        stop.store(true, Ordering::Relaxed);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let expired = expirer.join().unwrap();
            client.join().unwrap();
            let _ = done_tx.send(expired);
        });
        let expired = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("expiry and grant/renew threads deadlocked");
        assert!(expired > 0);
        manager.take_expired(Instant::now() + Duration::from_secs(3600));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_lease_expiry_loop() {
        let (manager, mut rx) = manager();
        let lease = manager.grant(0, 1).unwrap();
        manager.attach_keys(lease.id, vec![b"key".to_vec()]).unwrap();

        tokio::spawn(manager.clone().run_expiry_loop(Duration::from_millis(50)));

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.lease_id, lease.id);
        assert_eq!(event.keys, vec![b"key".to_vec()]);
    }
}
