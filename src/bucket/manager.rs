//! Bucket ownership manager.
//!
//! Owns the local view of the bucket lease table and this worker's owned
//! set. Ownership is reconciled against the consistent-hash assignment
//! computed from the live worker list; the ring is authoritative, leases
//! only bridge the gap while churn settles. Leases are mirrored to the
//! store so a restarting worker can prefer reclaiming the buckets it held
//! before, but the mirror is never consulted for correctness.
//!
//! Bucket transfer paths:
//! - graceful shutdown releases everything this worker holds;
//! - a member-removed notification drops the dead node's leases from the
//!   local view and triggers an immediate reconcile pass;
//! - a lease not renewed within the abandonment threshold is reclaimable
//!   by whoever the ring says should own the bucket.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::bucket::ring::desired_buckets;
use crate::model::BucketLease;
use crate::store::RunStore;

/// Ownership transitions pushed to the local scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketEvent {
    Acquired(u32),
    Lost(u32),
}

struct ManagerInner {
    /// bucketId -> lease, this worker's view of the cluster lease table.
    leases: HashMap<u32, BucketLease>,
    /// Buckets currently held by this worker.
    owned: HashSet<u32>,
    /// Live workers including self, from the membership feed.
    live_workers: Vec<String>,
}

pub struct BucketManager {
    self_addr: String,
    bucket_count: u32,
    abandon_threshold_ms: u64,
    store: Arc<dyn RunStore>,
    events_tx: mpsc::UnboundedSender<BucketEvent>,
    inner: RwLock<ManagerInner>,
}

impl BucketManager {
    pub fn new(
        self_addr: String,
        bucket_count: u32,
        abandon_threshold_ms: u64,
        store: Arc<dyn RunStore>,
        events_tx: mpsc::UnboundedSender<BucketEvent>,
    ) -> Self {
        Self {
            self_addr,
            bucket_count,
            abandon_threshold_ms,
            store,
            events_tx,
            inner: RwLock::new(ManagerInner {
                leases: HashMap::new(),
                owned: HashSet::new(),
                live_workers: Vec::new(),
            }),
        }
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub async fn owns(&self, bucket_id: u32) -> bool {
        self.inner.read().await.owned.contains(&bucket_id)
    }

    pub async fn owned_buckets(&self) -> HashSet<u32> {
        self.inner.read().await.owned.clone()
    }

    /// Reclaim buckets this worker held before a restart, ahead of the
    /// first reconcile pass. Purely an affinity optimization; the next
    /// reconcile releases anything the ring assigns elsewhere.
    pub async fn recover_previous(&self) {
        let previous = match self.store.select_buckets_by_owner(&self.self_addr).await {
            Ok(buckets) => buckets,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read previous leases, skipping recovery");
                return;
            }
        };
        if previous.is_empty() {
            return;
        }

        let mut recovered = 0usize;
        let mut inner = self.inner.write().await;
        for bucket_id in previous {
            if bucket_id < self.bucket_count && self.try_acquire_locked(&mut inner, bucket_id) {
                recovered += 1;
            }
        }
        drop(inner);
        tracing::info!(recovered, "Recovered previously held buckets");
    }

    /// Membership change: a worker joined (possibly self becoming live).
    pub async fn member_joined(&self, addr: &str) {
        {
            let mut inner = self.inner.write().await;
            if !inner.live_workers.iter().any(|w| w == addr) {
                inner.live_workers.push(addr.to_string());
            }
        }
        tracing::info!(addr, "Member joined, rebalancing buckets");
        self.reconcile().await;
    }

    /// Membership change: a worker left or was detected dead. Its leases
    /// are dropped from the local view so its buckets become acquirable
    /// immediately instead of after lease expiry.
    pub async fn member_removed(&self, addr: &str) {
        {
            let mut inner = self.inner.write().await;
            inner.live_workers.retain(|w| w != addr);
            let stale: Vec<u32> = inner
                .leases
                .iter()
                .filter(|(_, lease)| lease.is_owned_by(addr))
                .map(|(&bucket_id, _)| bucket_id)
                .collect();
            if !stale.is_empty() {
                tracing::info!(addr, buckets = stale.len(), "Clearing dead member's leases");
                for bucket_id in stale {
                    inner.leases.remove(&bucket_id);
                }
            }
        }
        // The dead worker cannot delete its own mirror rows; whoever
        // observes the removal clears them so takeover does not wait out
        // the abandonment threshold.
        if let Err(e) = self.store.delete_leases_by_owner(addr).await {
            tracing::warn!(addr, error = %e, "Failed to clear dead member's mirrored leases");
        }
        self.reconcile().await;
    }

    /// One reconcile pass: refresh foreign leases from the store mirror,
    /// acquire every desired bucket not blocked by an unexpired foreign
    /// lease, release every owned bucket the ring no longer assigns here.
    /// Runs on every membership change and on a periodic timer.
    pub async fn reconcile(&self) {
        // Best effort: a stale mirror only delays acquisition by one lease
        // expiry, it cannot produce a wrong assignment.
        let mirrored = self.store.select_all_leases().await.ok();

        let mut inner = self.inner.write().await;
        if let Some(mirrored) = mirrored {
            // Releases become visible through the mirror: a foreign lease
            // that disappeared from it is gone from the local view too.
            let mirror_ids: HashSet<u32> = mirrored.iter().map(|l| l.bucket_id).collect();
            let self_addr = self.self_addr.clone();
            inner.leases.retain(|bucket_id, lease| {
                lease.is_owned_by(&self_addr) || mirror_ids.contains(bucket_id)
            });
            for lease in mirrored {
                if !lease.is_owned_by(&self.self_addr) && !inner.owned.contains(&lease.bucket_id) {
                    inner.leases.insert(lease.bucket_id, lease);
                }
            }
        }

        let workers = if inner.live_workers.is_empty() {
            vec![self.self_addr.clone()]
        } else {
            inner.live_workers.clone()
        };
        let desired = desired_buckets(&self.self_addr, &workers, self.bucket_count);

        let mut acquired = 0usize;
        for &bucket_id in &desired {
            if !inner.owned.contains(&bucket_id) && self.try_acquire_locked(&mut inner, bucket_id) {
                acquired += 1;
            }
        }

        let to_release: Vec<u32> = inner
            .owned
            .iter()
            .copied()
            .filter(|bucket_id| !desired.contains(bucket_id))
            .collect();
        for bucket_id in &to_release {
            self.release_locked(&mut inner, *bucket_id);
        }

        tracing::debug!(
            workers = workers.len(),
            desired = desired.len(),
            acquired,
            released = to_release.len(),
            owned = inner.owned.len(),
            "Reconcile pass complete"
        );
    }

    /// Attempt to take one bucket. Fails silently when another worker
    /// still holds an unexpired lease on it.
    pub async fn try_acquire(&self, bucket_id: u32) -> bool {
        let mut inner = self.inner.write().await;
        self.try_acquire_locked(&mut inner, bucket_id)
    }

    fn try_acquire_locked(&self, inner: &mut ManagerInner, bucket_id: u32) -> bool {
        if let Some(lease) = inner.leases.get(&bucket_id) {
            if !lease.is_owned_by(&self.self_addr) && !lease.is_expired(self.abandon_threshold_ms) {
                return false;
            }
        }

        let lease = BucketLease::new(bucket_id, self.self_addr.clone());
        inner.leases.insert(bucket_id, lease.clone());
        let newly_owned = inner.owned.insert(bucket_id);

        if newly_owned {
            let _ = self.events_tx.send(BucketEvent::Acquired(bucket_id));
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.upsert_lease(lease).await {
                    tracing::warn!(bucket_id, error = %e, "Failed to mirror lease");
                }
            });
        }
        true
    }

    /// Extend the lease timestamp on every self-owned bucket.
    pub async fn renew_all(&self) {
        let mut inner = self.inner.write().await;
        let owned: Vec<u32> = inner.owned.iter().copied().collect();
        for bucket_id in owned {
            if let Some(lease) = inner.leases.get(&bucket_id) {
                if lease.is_owned_by(&self.self_addr) {
                    let renewed = lease.renewed();
                    inner.leases.insert(bucket_id, renewed.clone());
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store.upsert_lease(renewed).await {
                            tracing::debug!(bucket_id, error = %e, "Failed to mirror renewal");
                        }
                    });
                }
            }
        }
        tracing::debug!(count = inner.owned.len(), "Renewed bucket leases");
    }

    pub async fn release(&self, bucket_id: u32) {
        let mut inner = self.inner.write().await;
        self.release_locked(&mut inner, bucket_id);
    }

    fn release_locked(&self, inner: &mut ManagerInner, bucket_id: u32) {
        if inner.owned.remove(&bucket_id) {
            inner.leases.remove(&bucket_id);
            let _ = self.events_tx.send(BucketEvent::Lost(bucket_id));
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.delete_lease(bucket_id).await {
                    tracing::debug!(bucket_id, error = %e, "Failed to delete mirrored lease");
                }
            });
            tracing::info!(bucket_id, "Released bucket");
        }
    }

    /// Graceful shutdown: hand back every owned bucket.
    pub async fn release_all(&self) {
        let mut inner = self.inner.write().await;
        let owned: Vec<u32> = inner.owned.iter().copied().collect();
        tracing::info!(count = owned.len(), "Releasing all buckets");
        for bucket_id in owned {
            self.release_locked(&mut inner, bucket_id);
        }
    }
}
