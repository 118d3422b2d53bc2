//! Admin surface: DAG validation runs before any row is written, and
//! admin actions publish lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::Request;

use flowmesh::event::LifecycleOp;
use flowmesh::grpc::workflow_service::WorkflowServiceImpl;
use flowmesh::ident::IdGenerator;
use flowmesh::proto;
use flowmesh::proto::workflow_service_server::WorkflowService;
use flowmesh::store::MemoryStore;
use flowmesh::store::RunStore;
use flowmesh::transport::{EventPublisher, HubPublisher};

fn job_spec(name: &str) -> proto::JobSpecProto {
    proto::JobSpecProto {
        name: name.to_string(),
        handler: "true".to_string(),
        trigger_type: String::new(),
        trigger_value: String::new(),
        priority: 0,
        max_attempts: 0,
        backoff_ms: 1000,
    }
}

fn edge(child: i64, parent: i64) -> proto::DependencyEdgeProto {
    proto::DependencyEdgeProto {
        job_id: child,
        parent_job_id: parent,
    }
}

fn create_request(edges: Vec<proto::DependencyEdgeProto>) -> proto::CreateWorkflowRequest {
    proto::CreateWorkflowRequest {
        workflow: Some(proto::WorkflowSpecProto {
            name: "etl".to_string(),
            trigger_type: "manual".to_string(),
            trigger_value: String::new(),
            priority: 0,
        }),
        jobs: vec![job_spec("a"), job_spec("b"), job_spec("c")],
        dependencies: edges,
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    hub: Arc<HubPublisher>,
    service: WorkflowServiceImpl,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(HubPublisher::new());
    let publisher: Arc<dyn EventPublisher> = hub.clone();
    let service = WorkflowServiceImpl::new(
        store.clone(),
        publisher,
        Arc::new(IdGenerator::from_address("10.1.0.1:7450")),
    );
    Fixture {
        store,
        hub,
        service,
    }
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_with_no_rows_written() {
    let f = fixture();

    // c -> a -> c (indexes into the job list)
    let response = f
        .service
        .create_workflow(Request::new(create_request(vec![
            edge(0, 2),
            edge(2, 0),
        ])))
        .await
        .unwrap()
        .into_inner();

    assert!(!response.success);
    assert!(response.error.contains("cycle") || response.error.contains("Cycle"));
    assert_eq!(
        f.store.workflow_count().await,
        0,
        "validation failure must leave no partial state"
    );
}

#[tokio::test]
async fn self_dependency_is_rejected() {
    let f = fixture();
    let response = f
        .service
        .create_workflow(Request::new(create_request(vec![edge(1, 1)])))
        .await
        .unwrap()
        .into_inner();

    assert!(!response.success);
    assert_eq!(f.store.workflow_count().await, 0);
}

#[tokio::test]
async fn valid_workflow_is_persisted() {
    let f = fixture();
    let response = f
        .service
        .create_workflow(Request::new(create_request(vec![
            edge(2, 0),
            edge(2, 1),
        ])))
        .await
        .unwrap()
        .into_inner();

    assert!(response.success, "{}", response.error);
    assert_eq!(response.job_ids.len(), 3);
    assert_eq!(f.store.workflow_count().await, 1);

    let workflow = f
        .store
        .get_workflow(response.workflow_id)
        .await
        .unwrap()
        .expect("workflow persisted");
    assert_eq!(workflow.name, "etl");
}

#[tokio::test]
async fn online_publishes_a_snapshot_event() {
    let f = fixture();
    let (tx, mut rx) = mpsc::channel(8);
    f.hub.subscribe(tx).await;

    let created = f
        .service
        .create_workflow(Request::new(create_request(vec![edge(2, 0), edge(2, 1)])))
        .await
        .unwrap()
        .into_inner();
    assert!(created.success);

    let response = f
        .service
        .online_workflow(Request::new(proto::WorkflowActionRequest {
            workflow_id: created.workflow_id,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.success);

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event published")
        .expect("channel open");
    assert_eq!(event.event_id, response.event_id);
    match event.op {
        LifecycleOp::Online(snapshot) => {
            assert_eq!(snapshot.workflow_id, created.workflow_id);
            assert_eq!(snapshot.job_ids.len(), 3);
            assert_eq!(snapshot.dependencies.len(), 2);
        }
        other => panic!("expected online op, got {other:?}"),
    }
}

#[tokio::test]
async fn trigger_of_unknown_workflow_is_not_found() {
    let f = fixture();
    let status = f
        .service
        .trigger_workflow(Request::new(proto::WorkflowActionRequest {
            workflow_id: 424242,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}
