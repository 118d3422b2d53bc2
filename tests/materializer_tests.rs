//! Lifecycle-event materialization across workers.
//!
//! Verifies that:
//! - a trigger event materializes exactly one WorkflowRun, one JobRun per
//!   job and one run-dependency row per edge, regardless of worker count
//! - run ids match the deterministic derivation
//! - duplicate event delivery changes nothing
//! - the diamond workflow defers its sink job until both parents complete


use std::time::Duration;

use flowmesh::event::{LifecycleEvent, TriggerSnapshot};
use flowmesh::ident::deterministic_id;
use flowmesh::model::{DependencyEdge, RunStatus, TriggerSpec};
use flowmesh::store::RunStore;
use test_harness::{assert_eventually, seed_workflow, TestCluster};

const WORKFLOW_ID: i64 = 11;

fn diamond_snapshot() -> TriggerSnapshot {
    TriggerSnapshot {
        workflow_id: WORKFLOW_ID,
        job_ids: vec![1, 2, 3],
        dependencies: vec![
            DependencyEdge {
                job_id: 3,
                parent_job_id: 1,
            },
            DependencyEdge {
                job_id: 3,
                parent_job_id: 2,
            },
        ],
    }
}

async fn seed_diamond(cluster: &TestCluster, parent_handler: &str) {
    seed_workflow(
        &cluster.store,
        WORKFLOW_ID,
        TriggerSpec::Manual,
        &[(1, parent_handler), (2, parent_handler), (3, "true")],
        &[(3, 1), (3, 2)],
    )
    .await;
}

#[tokio::test]
async fn trigger_materializes_exactly_one_row_set() {
    let cluster = TestCluster::new(2, 16).await;
    cluster.settle().await;
    seed_diamond(&cluster, "true").await;

    let event = LifecycleEvent::manual_trigger(diamond_snapshot());
    let event_id = event.event_id.clone();
    cluster.publish(event).await;

    assert_eventually(
        || async { cluster.store.run_row_count().await == (1, 3, 2) },
        Duration::from_secs(5),
        "expected 1 workflow run, 3 job runs, 2 run-dependency rows",
    )
    .await;

    // Ids are reproducible from (event, entity) alone.
    let workflow_run_id = deterministic_id(&event_id, WORKFLOW_ID);
    assert!(cluster
        .store
        .get_workflow_run(workflow_run_id)
        .await
        .unwrap()
        .is_some());
    for job_id in [1, 2, 3] {
        let run = cluster
            .store
            .get_job_run(deterministic_id(&event_id, job_id))
            .await
            .unwrap()
            .expect("job run exists");
        assert_eq!(run.workflow_run_id, workflow_run_id);
        assert_eq!(run.job_id, job_id);
    }
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let cluster = TestCluster::new(2, 16).await;
    cluster.settle().await;
    seed_diamond(&cluster, "true").await;

    let event = LifecycleEvent::manual_trigger(diamond_snapshot());
    cluster.publish(event.clone()).await;

    assert_eventually(
        || async { cluster.store.run_row_count().await == (1, 3, 2) },
        Duration::from_secs(5),
        "first delivery should materialize the row set",
    )
    .await;

    // Deliver the very same event again to every worker.
    cluster.publish(event).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        cluster.store.run_row_count().await,
        (1, 3, 2),
        "redelivery must not create additional rows"
    );
}

#[tokio::test]
async fn diamond_sink_defers_until_both_parents_complete() {
    let cluster = TestCluster::new(2, 16).await;
    cluster.settle().await;
    // Parents take a moment, long enough to observe the deferred sink.
    seed_diamond(&cluster, "sleep 1").await;

    let event = LifecycleEvent::manual_trigger(diamond_snapshot());
    let event_id = event.event_id.clone();
    cluster.publish(event).await;

    let sink_run_id = deterministic_id(&event_id, 3);
    assert_eventually(
        || async {
            cluster
                .store
                .get_job_run(sink_run_id)
                .await
                .unwrap()
                .is_some()
        },
        Duration::from_secs(5),
        "sink run should be materialized",
    )
    .await;

    let sink = cluster
        .store
        .get_job_run(sink_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sink.status, RunStatus::Waiting);
    assert_eq!(
        sink.trigger_time, None,
        "dependent run starts with a deferred trigger time"
    );

    // Both parents finish, the sink's real trigger time is computed and
    // it runs to completion; the workflow run rolls up.
    assert_eventually(
        || async {
            cluster
                .store
                .get_job_run(sink_run_id)
                .await
                .unwrap()
                .map(|run| run.status == RunStatus::Completed)
                .unwrap_or(false)
        },
        Duration::from_secs(10),
        "sink should complete after both parents",
    )
    .await;

    let workflow_run_id = deterministic_id(&event_id, WORKFLOW_ID);
    assert_eventually(
        || async {
            cluster
                .store
                .get_workflow_run(workflow_run_id)
                .await
                .unwrap()
                .map(|run| run.status == RunStatus::Completed)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "workflow run should roll up to completed",
    )
    .await;
}

#[tokio::test]
async fn offline_cancels_waiting_but_not_running() {
    let cluster = TestCluster::new(2, 16).await;
    cluster.settle().await;
    // Parent runs long; the child waits on it.
    seed_workflow(
        &cluster.store,
        WORKFLOW_ID,
        TriggerSpec::Manual,
        &[(1, "sleep 30"), (2, "true")],
        &[(2, 1)],
    )
    .await;

    let snapshot = TriggerSnapshot {
        workflow_id: WORKFLOW_ID,
        job_ids: vec![1, 2],
        dependencies: vec![DependencyEdge {
            job_id: 2,
            parent_job_id: 1,
        }],
    };
    let event = LifecycleEvent::manual_trigger(snapshot);
    let event_id = event.event_id.clone();
    cluster.publish(event).await;

    let parent_run_id = deterministic_id(&event_id, 1);
    let child_run_id = deterministic_id(&event_id, 2);

    assert_eventually(
        || async {
            cluster
                .store
                .get_job_run(parent_run_id)
                .await
                .unwrap()
                .map(|run| run.status == RunStatus::Running)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "parent should be running",
    )
    .await;

    cluster.publish(LifecycleEvent::offline(WORKFLOW_ID)).await;

    assert_eventually(
        || async {
            cluster
                .store
                .get_job_run(child_run_id)
                .await
                .unwrap()
                .map(|run| run.status == RunStatus::Cancelled)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "waiting child should be cancelled by offline",
    )
    .await;

    // Offline drops not-yet-fired registrations only.
    assert_eq!(
        cluster
            .store
            .get_job_run(parent_run_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        RunStatus::Running
    );
}
