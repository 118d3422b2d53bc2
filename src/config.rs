use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FlowmeshError, Result};

/// Number of buckets in the fixed partition space. Every worker computes
/// ownership over the same space, so this must be identical cluster-wide.
pub const DEFAULT_BUCKET_COUNT: u32 = 1024;

/// TLS configuration for secure node communication.
///
/// When enabled, all gRPC communication uses mutual TLS (mTLS):
/// servers present their certificate and verify client certificates,
/// and both sides must be signed by the cluster CA.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this node's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this node's private key (PEM format).
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub addr: String, // host:port format, supports both IP and hostnames
}

/// Configuration for one worker node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable cluster-wide identity of this worker. Also the key under
    /// which bucket leases are recorded.
    pub advertise_addr: String,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,

    /// Size of the bucket partition space.
    pub bucket_count: u32,

    /// How often self-owned leases are renewed.
    pub lease_renewal_interval_ms: u64,
    /// A lease not renewed within this window is considered abandoned and
    /// may be reclaimed. Must be at least 3x the renewal interval.
    pub lease_abandon_threshold_ms: u64,

    /// Interval between heartbeats sent to each peer.
    pub heartbeat_interval_ms: u64,
    /// A peer silent for this long is reported as left.
    pub peer_timeout_ms: u64,

    /// Periodic reconcile pass interval (membership changes also trigger
    /// an immediate pass).
    pub reconcile_interval_ms: u64,

    /// Local scheduler tick interval.
    pub tick_interval_ms: u64,

    /// Default timeout applied to job handlers without their own.
    pub job_timeout_secs: u64,

    pub tls: TlsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            advertise_addr: "127.0.0.1:7450".to_string(),
            // SAFETY: hardcoded valid address that always parses
            listen_addr: "127.0.0.1:7450"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            lease_renewal_interval_ms: 10_000,
            lease_abandon_threshold_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            peer_timeout_ms: 5_000,
            reconcile_interval_ms: 10_000,
            tick_interval_ms: 500,
            job_timeout_secs: 3_600,
            tls: TlsConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(advertise_addr: String, listen_addr: SocketAddr) -> Self {
        Self {
            advertise_addr,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, addr: String) -> Self {
        self.peers.push(PeerConfig { addr });
        self
    }

    /// Reject timing combinations that would cause false lease reclaims:
    /// the abandonment threshold must cover at least three missed renewals.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(FlowmeshError::InvalidConfig(
                "bucket_count must be positive".to_string(),
            ));
        }
        if self.lease_abandon_threshold_ms < self.lease_renewal_interval_ms * 3 {
            return Err(FlowmeshError::InvalidConfig(format!(
                "lease_abandon_threshold_ms ({}) must be at least 3x lease_renewal_interval_ms ({})",
                self.lease_abandon_threshold_ms, self.lease_renewal_interval_ms
            )));
        }
        if self.peer_timeout_ms < self.heartbeat_interval_ms * 3 {
            return Err(FlowmeshError::InvalidConfig(format!(
                "peer_timeout_ms ({}) must be at least 3x heartbeat_interval_ms ({})",
                self.peer_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn lease_renewal_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renewal_interval_ms)
    }

    pub fn lease_abandon_threshold(&self) -> Duration {
        Duration::from_millis(self.lease_abandon_threshold_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default_is_valid() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.bucket_count, DEFAULT_BUCKET_COUNT);
        assert!(cfg.peers.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer("127.0.0.1:7451".to_string())
            .with_peer("127.0.0.1:7452".to_string());
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].addr, "127.0.0.1:7451");
    }

    #[test]
    fn validate_rejects_short_abandon_threshold() {
        let cfg = NodeConfig {
            lease_renewal_interval_ms: 10_000,
            lease_abandon_threshold_ms: 20_000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_buckets() {
        let cfg = NodeConfig {
            bucket_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tls_config_is_complete_when_all_paths_set() {
        let cfg = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/ca.pem")),
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: Some(PathBuf::from("/key.pem")),
        };
        assert!(cfg.is_complete());
    }

    #[test]
    fn tls_config_is_not_complete_when_disabled() {
        let cfg = TlsConfig {
            enabled: false,
            ca_cert_path: Some(PathBuf::from("/ca.pem")),
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: Some(PathBuf::from("/key.pem")),
        };
        assert!(!cfg.is_complete());
    }
}
