//! Consistent-hash ring over the live worker set.
//!
//! The assignment must be a pure function of the worker list: every worker
//! recomputes it independently on membership changes and all of them must
//! converge to the same bucket->owner map with no negotiation. Hashing
//! therefore uses the crate's stable hash, never the randomly seeded std
//! hasher.

use std::collections::{BTreeMap, HashSet};

use crate::ident::stable_hash64;

/// Virtual points placed on the ring per worker. Hundreds of points keep
/// the per-worker bucket share within a few percent of even.
const VIRTUAL_POINTS: u32 = 160;

#[derive(Debug)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new(workers: &[String]) -> Self {
        let mut points = BTreeMap::new();
        for worker in workers {
            for i in 0..VIRTUAL_POINTS {
                let key = stable_hash64(format!("{worker}#{i}").as_bytes());
                points.insert(key, worker.clone());
            }
        }
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Ring successor of the key's hash, wrapping at the top.
    pub fn select(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = stable_hash64(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, worker)| worker.as_str())
    }

    pub fn owner_of_bucket(&self, bucket_id: u32) -> Option<&str> {
        self.select(&bucket_id.to_string())
    }
}

/// Buckets out of `0..bucket_count` whose ring successor is `self_addr`.
/// Pure function of the worker list; identical on every worker.
pub fn desired_buckets(self_addr: &str, workers: &[String], bucket_count: u32) -> HashSet<u32> {
    let ring = HashRing::new(workers);
    (0..bucket_count)
        .filter(|&bucket_id| ring.owner_of_bucket(bucket_id) == Some(self_addr))
        .collect()
}
