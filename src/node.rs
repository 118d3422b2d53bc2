//! Node assembly: constructs every component explicitly and spawns the
//! concurrent roles, coordinated only through channels and the store.
//!
//! Roles (each its own task):
//! 1. membership loop: heartbeat failure detection feeding the bucket
//!    manager
//! 2. heartbeat loop: liveness probes to each configured peer
//! 3. lease loop: periodic reconcile and renew passes
//! 4. lifecycle-event loop: the materializer consuming broadcasts
//! 5. scheduler loop: per-bucket trigger queues and dependency gating
//! 6. completion pump: dispatcher reports back into store, scheduler
//!    and broadcast
//! 7. gRPC server: admin surface plus worker-to-worker RPC (blocks)

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketEvent, BucketManager};
use crate::config::NodeConfig;
use crate::dispatch::{CompletionReport, Dispatcher, ProcessDispatcher};
use crate::error::Result;
use crate::event::{LifecycleEvent, LifecycleOp};
use crate::grpc::GrpcServer;
use crate::ident::IdGenerator;
use crate::materializer::RunMaterializer;
use crate::membership::{MembershipEvent, PeerMonitor};
use crate::model::RunStatus;
use crate::proto;
use crate::scheduler::{LocalScheduler, SchedulerMessage};
use crate::store::RunStore;
use crate::tls::TlsIdentity;
use crate::transport::{EventPublisher, GrpcBroadcaster, PeerClients};

pub struct Node {
    config: NodeConfig,
    store: Arc<dyn RunStore>,
}

impl Node {
    pub fn new(config: NodeConfig, store: Arc<dyn RunStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, store })
    }

    /// Run the worker until the shutdown token fires. Blocks on the gRPC
    /// server; every other role runs as a spawned task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config.clone();
        let store = self.store.clone();
        let self_addr = config.advertise_addr.clone();

        let tls_identity = if config.tls.is_complete() {
            Some(
                TlsIdentity::load(&config.tls)
                    .await
                    .map_err(|e| crate::error::FlowmeshError::InvalidConfig(e.to_string()))?,
            )
        } else {
            None
        };

        // Channels between the roles.
        let (bucket_tx, bucket_rx) = mpsc::unbounded_channel::<BucketEvent>();
        let (member_tx, member_rx) = mpsc::unbounded_channel::<MembershipEvent>();
        let (event_tx, event_rx) = mpsc::channel::<LifecycleEvent>(256);
        let (sched_tx, sched_rx) = mpsc::channel::<SchedulerMessage>(1024);
        let (reports_tx, reports_rx) = mpsc::channel::<CompletionReport>(256);

        let buckets = Arc::new(BucketManager::new(
            self_addr.clone(),
            config.bucket_count,
            config.lease_abandon_threshold_ms,
            store.clone(),
            bucket_tx,
        ));
        let monitor = Arc::new(PeerMonitor::new(
            self_addr.clone(),
            config.peer_timeout_ms,
            member_tx,
        ));
        let id_gen = Arc::new(IdGenerator::from_address(&self_addr));
        let clients = Arc::new(PeerClients::new(tls_identity));
        let peer_addrs: Vec<String> = config.peers.iter().map(|p| p.addr.clone()).collect();
        let publisher: Arc<dyn EventPublisher> = Arc::new(GrpcBroadcaster::new(
            event_tx.clone(),
            peer_addrs.clone(),
            clients.clone(),
        ));
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(ProcessDispatcher::new(reports_tx));
        let materializer = Arc::new(RunMaterializer::new(
            store.clone(),
            buckets.clone(),
            sched_tx.clone(),
            id_gen.clone(),
        ));

        // Reclaim previously held buckets, then enter the ring.
        buckets.recover_previous().await;
        buckets.member_joined(&self_addr).await;

        let scheduler = LocalScheduler::new(store.clone(), dispatcher.clone(), config.job_timeout_secs);
        tokio::spawn(scheduler.run(sched_rx, config.tick_interval(), shutdown.clone()));

        tokio::spawn(bucket_event_pump(bucket_rx, sched_tx.clone(), shutdown.clone()));
        tokio::spawn(membership_loop(
            member_rx,
            monitor.clone(),
            buckets.clone(),
            config.heartbeat_interval_ms,
            shutdown.clone(),
        ));
        tokio::spawn(heartbeat_loop(
            self_addr.clone(),
            peer_addrs,
            clients,
            monitor.clone(),
            config.heartbeat_interval_ms,
            shutdown.clone(),
        ));
        tokio::spawn(lease_loop(buckets.clone(), config.clone(), shutdown.clone()));
        tokio::spawn(event_loop(event_rx, materializer, shutdown.clone()));
        tokio::spawn(completion_pump(
            store.clone(),
            sched_tx,
            publisher.clone(),
            reports_rx,
            shutdown.clone(),
        ));

        let server = GrpcServer::new(
            config.listen_addr,
            config.clone(),
            monitor,
            buckets,
            store,
            publisher,
            id_gen,
            event_tx,
        );
        server.run(shutdown).await
    }
}

/// Forward ownership transitions into the scheduler.
pub async fn bucket_event_pump(
    mut bucket_rx: mpsc::UnboundedReceiver<BucketEvent>,
    sched_tx: mpsc::Sender<SchedulerMessage>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            Some(event) = bucket_rx.recv() => {
                let msg = match event {
                    BucketEvent::Acquired(bucket_id) => SchedulerMessage::BucketAcquired { bucket_id },
                    BucketEvent::Lost(bucket_id) => SchedulerMessage::BucketLost { bucket_id },
                };
                if sched_tx.send(msg).await.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
            else => break,
        }
    }
}

/// Consume membership events and sweep for silent peers. Event handling
/// must never block behind materialization, so this is its own task.
pub async fn membership_loop(
    mut member_rx: mpsc::UnboundedReceiver<MembershipEvent>,
    monitor: Arc<PeerMonitor>,
    buckets: Arc<BucketManager>,
    sweep_interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut sweep = tokio::time::interval(std::time::Duration::from_millis(sweep_interval_ms));
    loop {
        tokio::select! {
            Some(event) = member_rx.recv() => {
                match event {
                    MembershipEvent::Joined(addr) => buckets.member_joined(&addr).await,
                    MembershipEvent::Left(addr) => buckets.member_removed(&addr).await,
                }
            }
            _ = sweep.tick() => {
                monitor.check_dead().await;
            }
            _ = shutdown.cancelled() => break,
            else => break,
        }
    }
}

/// Probe each configured peer. A successful response also counts as an
/// observation of that peer being alive.
pub async fn heartbeat_loop(
    self_addr: String,
    peers: Vec<String>,
    clients: Arc<PeerClients>,
    monitor: Arc<PeerMonitor>,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for addr in &peers {
                    match clients.client(addr).await {
                        Ok(mut client) => {
                            let req = proto::HeartbeatRequest {
                                address: self_addr.clone(),
                            };
                            match client.heartbeat(req).await {
                                Ok(_) => monitor.observe_heartbeat(addr).await,
                                Err(e) => {
                                    tracing::debug!(peer = %addr, error = %e, "Heartbeat failed");
                                    clients.invalidate(addr).await;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(peer = %addr, error = %e, "Peer unreachable");
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Periodic lease maintenance; releases everything on shutdown.
pub async fn lease_loop(
    buckets: Arc<BucketManager>,
    config: NodeConfig,
    shutdown: CancellationToken,
) {
    let mut renew = tokio::time::interval(config.lease_renewal_interval());
    let mut reconcile =
        tokio::time::interval(std::time::Duration::from_millis(config.reconcile_interval_ms));
    loop {
        tokio::select! {
            _ = renew.tick() => buckets.renew_all().await,
            _ = reconcile.tick() => buckets.reconcile().await,
            _ = shutdown.cancelled() => {
                buckets.release_all().await;
                break;
            }
        }
    }
}

/// Materializer loop: applies each broadcast event in delivery order.
pub async fn event_loop(
    mut event_rx: mpsc::Receiver<LifecycleEvent>,
    materializer: Arc<RunMaterializer>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if let Err(e) = materializer.handle_event(&event).await {
                    // Fail closed: redelivery or the bucket backlog scan
                    // picks the event's effects up later.
                    tracing::warn!(event_id = %event.event_id, error = %e, "Event handling failed");
                }
            }
            _ = shutdown.cancelled() => break,
            else => break,
        }
    }
}

/// Dispatcher completions: conditional store transition out of Running,
/// local scheduler bookkeeping, then cluster-wide completion broadcast.
pub async fn completion_pump(
    store: Arc<dyn RunStore>,
    sched_tx: mpsc::Sender<SchedulerMessage>,
    publisher: Arc<dyn EventPublisher>,
    mut reports_rx: mpsc::Receiver<CompletionReport>,
    shutdown: CancellationToken,
) {
    loop {
        let report = tokio::select! {
            report = reports_rx.recv() => match report {
                Some(report) => report,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        tracing::info!(
            job_run_id = report.job_run_id,
            status = %report.status,
            retry_count = report.retry_count,
            "Run finished"
        );

        // Guarded on Running: a KILL observed mid-flight may already have
        // moved the row to Cancelled, which wins.
        let updated = store
            .update_job_run_status_if(
                report.job_run_id,
                &[RunStatus::Running],
                report.status,
                Some(report.retry_count),
            )
            .await
            .unwrap_or(false);

        let final_status = if updated {
            report.status
        } else {
            match store.get_job_run(report.job_run_id).await {
                Ok(Some(run)) => run.status,
                _ => report.status,
            }
        };

        let _ = sched_tx
            .send(SchedulerMessage::RunFinished {
                run_id: report.job_run_id,
                status: final_status,
            })
            .await;

        let event = LifecycleEvent::new(LifecycleOp::RunCompleted {
            job_run_id: report.job_run_id,
            workflow_run_id: report.workflow_run_id,
            status: final_status,
        });
        if let Err(e) = publisher.publish(event).await {
            tracing::warn!(
                job_run_id = report.job_run_id,
                error = %e,
                "Completion broadcast failed"
            );
        }
    }
}
