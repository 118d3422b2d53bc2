use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use crate::bucket::BucketManager;
use crate::event::{event_from_proto, LifecycleEvent};
use crate::membership::PeerMonitor;
use crate::proto;
use crate::proto::cluster_service_server::ClusterService;
use crate::store::RunStore;

/// Worker-to-worker service: heartbeats, event fan-in, status.
pub struct ClusterServiceImpl {
    monitor: Arc<PeerMonitor>,
    buckets: Arc<BucketManager>,
    store: Arc<dyn RunStore>,
    event_tx: mpsc::Sender<LifecycleEvent>,
}

impl ClusterServiceImpl {
    pub fn new(
        monitor: Arc<PeerMonitor>,
        buckets: Arc<BucketManager>,
        store: Arc<dyn RunStore>,
        event_tx: mpsc::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            monitor,
            buckets,
            store,
            event_tx,
        }
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.monitor.observe_heartbeat(&req.address).await;
        Ok(Response::new(proto::HeartbeatResponse { ok: true }))
    }

    async fn deliver_event(
        &self,
        request: Request<proto::LifecycleEventProto>,
    ) -> Result<Response<proto::DeliverEventResponse>, Status> {
        let event = event_from_proto(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        self.event_tx
            .send(event)
            .await
            .map_err(|_| Status::unavailable("event channel closed"))?;

        Ok(Response::new(proto::DeliverEventResponse { accepted: true }))
    }

    async fn get_cluster_status(
        &self,
        _request: Request<proto::ClusterStatusRequest>,
    ) -> Result<Response<proto::ClusterStatusResponse>, Status> {
        let owned = self.buckets.owned_buckets().await;
        let registered_runs = self
            .store
            .select_waiting_job_runs_by_buckets(&owned)
            .await
            .map(|runs| runs.len() as u64)
            .unwrap_or(0);

        Ok(Response::new(proto::ClusterStatusResponse {
            address: self.monitor.self_addr().to_string(),
            live_workers: self.monitor.live_workers().await,
            owned_buckets: owned.len() as u32,
            bucket_count: self.buckets.bucket_count(),
            registered_runs,
        }))
    }
}
