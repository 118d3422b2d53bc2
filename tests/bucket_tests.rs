//! Bucket ownership across a multi-worker cluster.
//!
//! Verifies that:
//! - the consistent-hash assignment partitions the bucket space exactly
//! - removing a worker reassigns all of its buckets to the survivors
//! - a new worker picks up its share without double ownership settling in


use std::time::Duration;
use test_harness::{assert_eventually, TestCluster};

#[tokio::test]
async fn three_workers_partition_the_bucket_space() {
    let cluster = TestCluster::new(3, 1024).await;

    assert_eventually(
        || async { cluster.ownership_is_partition().await },
        Duration::from_secs(5),
        "every bucket should have exactly one owner",
    )
    .await;

    // No worker hoards the space: with 160 virtual points each, every
    // worker holds a meaningful share.
    for worker in cluster.workers.values() {
        let share = worker.buckets.owned_buckets().await.len();
        assert!(share > 0, "worker {} owns nothing", worker.addr);
        assert!(share < 1024, "worker {} owns everything", worker.addr);
    }
}

#[tokio::test]
async fn removed_workers_buckets_move_to_survivors() {
    let mut cluster = TestCluster::new(3, 1024).await;
    assert_eventually(
        || async { cluster.ownership_is_partition().await },
        Duration::from_secs(5),
        "initial ownership should settle",
    )
    .await;

    let victim = cluster.workers.keys().next().unwrap().clone();
    let victim_share = cluster.workers[&victim].buckets.owned_buckets().await;
    assert!(!victim_share.is_empty());

    cluster.remove_worker(&victim).await;

    // Member-removed triggers an immediate reconcile pass on the
    // survivors; nothing waits for lease expiry.
    assert_eventually(
        || async { cluster.ownership_is_partition().await },
        Duration::from_secs(5),
        "survivors should cover the full bucket space",
    )
    .await;
    assert_eq!(cluster.owned_union().await.len(), 1024);
}

#[tokio::test]
async fn joining_worker_takes_a_share_without_overlap() {
    let mut cluster = TestCluster::new(2, 256).await;
    assert_eventually(
        || async { cluster.ownership_is_partition().await },
        Duration::from_secs(5),
        "initial ownership should settle",
    )
    .await;

    cluster.add_worker("10.1.0.9:7450").await;

    assert_eventually(
        || async { cluster.ownership_is_partition().await },
        Duration::from_secs(5),
        "ownership should re-partition after the join",
    )
    .await;

    let newcomer = &cluster.workers["10.1.0.9:7450"];
    assert!(
        !newcomer.buckets.owned_buckets().await.is_empty(),
        "the new worker should own part of the space"
    );
}
