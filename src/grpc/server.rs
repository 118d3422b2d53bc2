use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::bucket::BucketManager;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::event::LifecycleEvent;
use crate::grpc::cluster_service::ClusterServiceImpl;
use crate::grpc::workflow_service::WorkflowServiceImpl;
use crate::ident::IdGenerator;
use crate::membership::PeerMonitor;
use crate::proto::cluster_service_server::ClusterServiceServer;
use crate::proto::workflow_service_server::WorkflowServiceServer;
use crate::store::RunStore;
use crate::tls::TlsIdentity;
use crate::transport::EventPublisher;

/// Serves both the worker-to-worker and the admin surface on one port.
pub struct GrpcServer {
    listen_addr: SocketAddr,
    config: NodeConfig,
    monitor: Arc<PeerMonitor>,
    buckets: Arc<BucketManager>,
    store: Arc<dyn RunStore>,
    publisher: Arc<dyn EventPublisher>,
    id_gen: Arc<IdGenerator>,
    event_tx: mpsc::Sender<LifecycleEvent>,
}

impl GrpcServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listen_addr: SocketAddr,
        config: NodeConfig,
        monitor: Arc<PeerMonitor>,
        buckets: Arc<BucketManager>,
        store: Arc<dyn RunStore>,
        publisher: Arc<dyn EventPublisher>,
        id_gen: Arc<IdGenerator>,
        event_tx: mpsc::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            listen_addr,
            config,
            monitor,
            buckets,
            store,
            publisher,
            id_gen,
            event_tx,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let cluster = ClusterServiceImpl::new(
            self.monitor,
            self.buckets,
            self.store.clone(),
            self.event_tx,
        );
        let workflow = WorkflowServiceImpl::new(self.store, self.publisher, self.id_gen);

        let mut builder = Server::builder();
        if self.config.tls.is_complete() {
            let identity = TlsIdentity::load(&self.config.tls)
                .await
                .map_err(|e| crate::error::FlowmeshError::InvalidConfig(e.to_string()))?;
            builder = builder.tls_config(identity.server_tls_config())?;
            tracing::info!("gRPC server using mTLS");
        }

        tracing::info!(addr = %self.listen_addr, "Starting gRPC server");
        builder
            .add_service(ClusterServiceServer::new(cluster))
            .add_service(WorkflowServiceServer::new(workflow))
            .serve_with_shutdown(self.listen_addr, shutdown.cancelled())
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
