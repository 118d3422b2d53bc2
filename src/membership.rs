//! Cluster membership feed.
//!
//! The core treats membership as an event source: joined/left
//! notifications with a stable per-member address. `PeerMonitor` is the
//! production implementation, a timeout failure detector fed by gRPC
//! heartbeats between peers. Tests script the same events directly.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

struct PeerState {
    last_heartbeat: Instant,
}

/// Tracks which peers are alive and emits membership events.
///
/// A peer is registered on its first observed heartbeat and reported as
/// left after `timeout_ms` of silence or on an explicit graceful
/// departure. Self is always considered live.
pub struct PeerMonitor {
    self_addr: String,
    timeout_ms: u64,
    peers: RwLock<HashMap<String, PeerState>>,
    events_tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl PeerMonitor {
    pub fn new(
        self_addr: String,
        timeout_ms: u64,
        events_tx: mpsc::UnboundedSender<MembershipEvent>,
    ) -> Self {
        Self {
            self_addr,
            timeout_ms,
            peers: RwLock::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// Record a heartbeat from `addr`. First contact registers the peer
    /// and emits Joined.
    pub async fn observe_heartbeat(&self, addr: &str) {
        if addr == self.self_addr {
            return;
        }
        let mut peers = self.peers.write().await;
        match peers.get_mut(addr) {
            Some(state) => state.last_heartbeat = Instant::now(),
            None => {
                peers.insert(
                    addr.to_string(),
                    PeerState {
                        last_heartbeat: Instant::now(),
                    },
                );
                tracing::info!(addr, "Peer joined");
                let _ = self.events_tx.send(MembershipEvent::Joined(addr.to_string()));
            }
        }
    }

    /// Graceful departure announced by the peer itself.
    pub async fn mark_left(&self, addr: &str) {
        let mut peers = self.peers.write().await;
        if peers.remove(addr).is_some() {
            tracing::info!(addr, "Peer left");
            let _ = self.events_tx.send(MembershipEvent::Left(addr.to_string()));
        }
    }

    /// Sweep for silent peers. Called periodically from the node's
    /// membership loop.
    pub async fn check_dead(&self) {
        let mut peers = self.peers.write().await;
        let dead: Vec<String> = peers
            .iter()
            .filter(|(_, state)| {
                state.last_heartbeat.elapsed().as_millis() >= self.timeout_ms as u128
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in dead {
            peers.remove(&addr);
            tracing::warn!(addr = %addr, "Peer heartbeat timed out");
            let _ = self.events_tx.send(MembershipEvent::Left(addr));
        }
    }

    /// Live workers including self, the input to the consistent-hash
    /// assignment.
    pub async fn live_workers(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut workers: Vec<String> = peers.keys().cloned().collect();
        workers.push(self.self_addr.clone());
        workers.sort();
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor(timeout_ms: u64) -> (PeerMonitor, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerMonitor::new("w1".to_string(), timeout_ms, tx), rx)
    }

    #[tokio::test]
    async fn first_heartbeat_emits_joined() {
        let (mon, mut rx) = monitor(5_000);
        mon.observe_heartbeat("w2").await;
        mon.observe_heartbeat("w2").await;

        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Joined("w2".to_string()));
        assert!(rx.try_recv().is_err(), "repeat heartbeat must not re-emit");
        assert_eq!(mon.live_workers().await, vec!["w1", "w2"]);
    }

    #[tokio::test]
    async fn own_heartbeat_is_ignored() {
        let (mon, mut rx) = monitor(5_000);
        mon.observe_heartbeat("w1").await;
        assert!(rx.try_recv().is_err());
        assert_eq!(mon.live_workers().await, vec!["w1"]);
    }

    #[tokio::test]
    async fn silent_peer_is_reported_left() {
        let (mon, mut rx) = monitor(20);
        mon.observe_heartbeat("w2").await;
        let _ = rx.try_recv();

        tokio::time::sleep(Duration::from_millis(40)).await;
        mon.check_dead().await;

        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Left("w2".to_string()));
        assert_eq!(mon.live_workers().await, vec!["w1"]);
    }

    #[tokio::test]
    async fn graceful_leave_emits_once() {
        let (mon, mut rx) = monitor(5_000);
        mon.observe_heartbeat("w2").await;
        let _ = rx.try_recv();

        mon.mark_left("w2").await;
        mon.mark_left("w2").await;
        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Left("w2".to_string()));
        assert!(rx.try_recv().is_err());
    }
}
