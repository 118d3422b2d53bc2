//! Broadcast transport.
//!
//! Lifecycle events are published once and delivered to every live worker
//! at-least-once: local delivery goes straight onto the node's event
//! channel, remote delivery is a gRPC fan-out with bounded retry.
//! Consumers tolerate duplicates via the idempotent materialization, so a
//! redelivered event is noise, not a hazard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tonic::transport::{Channel, Endpoint};

use crate::error::{FlowmeshError, Result};
use crate::event::{event_to_proto, LifecycleEvent};
use crate::proto::cluster_service_client::ClusterServiceClient;
use crate::tls::TlsIdentity;

const SEND_ATTEMPTS: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event to every live worker, including this one.
    async fn publish(&self, event: LifecycleEvent) -> Result<()>;
}

/// Lazily connected gRPC clients to the configured peers.
pub struct PeerClients {
    tls: Option<TlsIdentity>,
    clients: Mutex<HashMap<String, ClusterServiceClient<Channel>>>,
}

impl PeerClients {
    pub fn new(tls: Option<TlsIdentity>) -> Self {
        Self {
            tls,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn client(&self, addr: &str) -> Result<ClusterServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
            .map_err(|e| FlowmeshError::Internal(format!("bad peer address {addr}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.client_tls_config())?;
        }

        let channel = endpoint.connect().await?;
        let client = ClusterServiceClient::new(channel);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a cached client after a send failure so the next call
    /// reconnects.
    pub async fn invalidate(&self, addr: &str) {
        self.clients.lock().await.remove(addr);
    }
}

/// gRPC fan-out publisher used by the running node.
pub struct GrpcBroadcaster {
    local_tx: mpsc::Sender<LifecycleEvent>,
    peers: Vec<String>,
    clients: std::sync::Arc<PeerClients>,
}

impl GrpcBroadcaster {
    pub fn new(
        local_tx: mpsc::Sender<LifecycleEvent>,
        peers: Vec<String>,
        clients: std::sync::Arc<PeerClients>,
    ) -> Self {
        Self {
            local_tx,
            peers,
            clients,
        }
    }

    async fn deliver_to_peer(
        clients: &PeerClients,
        addr: &str,
        event: &LifecycleEvent,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SEND_RETRY_BACKOFF).await;
            }
            match clients.client(addr).await {
                Ok(mut client) => {
                    match client.deliver_event(event_to_proto(event)).await {
                        Ok(_) => return Ok(()),
                        Err(status) => {
                            clients.invalidate(addr).await;
                            last_err = Some(FlowmeshError::Grpc(status));
                        }
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| FlowmeshError::Internal("unreachable".to_string())))
    }
}

#[async_trait]
impl EventPublisher for GrpcBroadcaster {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        // Local delivery first keeps per-publisher event order on this
        // worker; remote workers see publish order per connection.
        self.local_tx
            .send(event.clone())
            .await
            .map_err(|_| FlowmeshError::Internal("local event channel closed".to_string()))?;

        for addr in &self.peers {
            let addr = addr.clone();
            let event = event.clone();
            let clients = self.clients.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::deliver_to_peer(&clients, &addr, &event).await {
                    // A worker that misses an event catches up through the
                    // bucket backlog scan when ownership next moves.
                    tracing::warn!(
                        peer = %addr,
                        event_id = %event.event_id,
                        error = %e,
                        "Event delivery to peer failed after retries"
                    );
                }
            });
        }
        Ok(())
    }
}

/// In-process publisher used by integration tests: clones every event to
/// each registered worker's event channel, preserving publish order.
pub struct HubPublisher {
    subscribers: Mutex<Vec<mpsc::Sender<LifecycleEvent>>>,
}

impl HubPublisher {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, tx: mpsc::Sender<LifecycleEvent>) {
        self.subscribers.lock().await.push(tx);
    }
}

impl Default for HubPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for HubPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        let subscribers = self.subscribers.lock().await;
        for tx in subscribers.iter() {
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_to_every_subscriber_in_order() {
        let hub = HubPublisher::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.subscribe(tx1).await;
        hub.subscribe(tx2).await;

        let first = LifecycleEvent::offline(1);
        let second = LifecycleEvent::offline(2);
        hub.publish(first.clone()).await.unwrap();
        hub.publish(second.clone()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().event_id, first.event_id);
        assert_eq!(rx1.recv().await.unwrap().event_id, second.event_id);
        assert_eq!(rx2.recv().await.unwrap().event_id, first.event_id);
        assert_eq!(rx2.recv().await.unwrap().event_id, second.event_id);
    }
}
