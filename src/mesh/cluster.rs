//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, gossip of per-node counter contributions, and
//! rendezvous ownership of counter keys.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Gossip key under which each node advertises its HTTP address.
const HTTP_ADDR_KEY: &str = "http_addr";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// HTTP address peers use to forward counter commands to this node.
    pub http_advertise_addr: Option<SocketAddr>,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            http_advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: "hivelimit".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Where the authoritative counter for a key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// This node owns the key.
    Local,
    /// A peer owns the key and serves counter commands at this address.
    Remote { node_id: String, http_addr: SocketAddr },
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Shared chitchat state.
    chitchat: Arc<Mutex<Chitchat>>,
    /// Chitchat handle, taken on shutdown.
    handle: parking_lot::Mutex<Option<ChitchatHandle>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            http_advertise_addr = ?config.http_advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_key_values = config
            .http_advertise_addr
            .map(|addr| vec![(HTTP_ADDR_KEY.to_string(), addr.to_string())])
            .unwrap_or_default();

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, initial_key_values, &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            chitchat: handle.chitchat(),
            handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add `amount` to our contribution for `key` and return the total
    /// across all live nodes.
    pub async fn increment_counter(&self, key: &str, amount: u64) -> u64 {
        let mut chitchat = self.chitchat.lock().await;

        let current_local = Self::local_value(&mut chitchat, key);
        let new_local = current_local.saturating_add(amount);
        chitchat.self_node_state().set(key, new_local.to_string());

        debug!(key = %key, local_value = new_local, "Incremented local counter");

        Self::sum_counter(&chitchat, key)
    }

    /// Get the total count for a key across all live nodes.
    pub async fn get_count(&self, key: &str) -> u64 {
        let chitchat = self.chitchat.lock().await;
        Self::sum_counter(&chitchat, key)
    }

    /// Remove our contribution for a key.
    pub async fn delete_counter(&self, key: &str) {
        let mut chitchat = self.chitchat.lock().await;
        chitchat.self_node_state().delete(key);
    }

    fn local_value(chitchat: &mut Chitchat, key: &str) -> u64 {
        chitchat
            .self_node_state()
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Sum a counter across all live nodes (including ourselves).
    fn sum_counter(chitchat: &Chitchat, key: &str) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|node_state| node_state.get(key))
            .filter_map(|value| value.parse::<u64>().ok())
            .fold(0u64, |total, count| total.saturating_add(count))
    }

    /// Pick the owner of `key` among live nodes by rendezvous hashing.
    ///
    /// Nodes that have not advertised an HTTP address cannot serve counter
    /// commands and are skipped. With no eligible peer the key is local.
    pub async fn owner_of(&self, key: &str) -> Owner {
        let chitchat = self.chitchat.lock().await;

        let mut best: Option<(u64, Owner)> = None;
        for chitchat_id in chitchat.live_nodes() {
            let owner = if chitchat_id.node_id == self.node_id {
                Owner::Local
            } else {
                let http_addr = chitchat
                    .node_state(chitchat_id)
                    .and_then(|state| state.get(HTTP_ADDR_KEY))
                    .and_then(|addr| addr.parse::<SocketAddr>().ok());
                match http_addr {
                    Some(http_addr) => Owner::Remote {
                        node_id: chitchat_id.node_id.clone(),
                        http_addr,
                    },
                    None => continue,
                }
            };

            let score = rendezvous_score(&chitchat_id.node_id, key);
            if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                best = Some((score, owner));
            }
        }

        best.map(|(_, owner)| owner).unwrap_or(Owner::Local)
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat = self.chitchat.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully. Subsequent calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            info!(node_id = %self.node_id, "Shutting down cluster node");
            handle
                .shutdown()
                .await
                .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        }
        Ok(())
    }
}

/// Score of `node_id` for `key`; the highest score owns the key.
fn rendezvous_score(node_id: &str, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
