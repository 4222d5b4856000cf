//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for distributed rate limiting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

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
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

/// Successful writes between sweeps of this node's expired entries.
pub const SWEEP_INTERVAL: u64 = 1024;

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "throttle".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Key identifying a throttle identity's arrival time in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TatKey {
    /// The throttle identity (fingerprint or plain key).
    pub identity: String,
}

impl TatKey {
    const PREFIX: &'static str = "tat|";

    /// Create a new key.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "tat|{identity}"
    pub fn to_chitchat_key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.identity)
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let identity = key.strip_prefix(Self::PREFIX)?;
        if identity.is_empty() {
            return None;
        }
        Some(Self::new(identity))
    }
}

/// A node's published value for a [`TatKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TatEntry {
    /// Theoretical arrival time, nanoseconds since the epoch.
    pub tat: i64,
    /// When the entry stops being visible, milliseconds since the epoch.
    pub expires_at_ms: i64,
}

impl TatEntry {
    /// Create a new entry.
    pub fn new(tat: i64, expires_at_ms: i64) -> Self {
        Self {
            tat,
            expires_at_ms,
        }
    }

    /// Whether the entry is still visible at `now_ms`.
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }

    /// Encode as a chitchat value.
    /// Format: "{tat}|{expires_at_ms}"
    pub fn encode(&self) -> String {
        format!("{}|{}", self.tat, self.expires_at_ms)
    }

    /// Decode a chitchat value.
    pub fn decode(value: &str) -> Option<Self> {
        let (tat, expires) = value.split_once('|')?;
        Some(Self {
            tat: tat.parse().ok()?,
            expires_at_ms: expires.parse().ok()?,
        })
    }
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    /// Successful conditional writes, for sweep scheduling.
    writes: AtomicU64,
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

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
            writes: AtomicU64::new(0),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Read the freshest live entry for `key` across all live nodes.
    ///
    /// Arrival times only move forward, so the largest one any node has
    /// published is the most recent decision the cluster knows about.
    pub async fn read_entry(&self, key: &TatKey, now_ms: i64) -> Option<TatEntry> {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::max_live_entry(&chitchat, &chitchat_key, now_ms)
    }

    /// Publish `entry` for `key` from this node, but only if the key's
    /// current visibility matches `expect_present`.
    ///
    /// The check and the write happen under one lock, so concurrent writers
    /// on this node are serialized. Returns `true` if the entry was written.
    pub async fn write_entry_if(
        &self,
        key: &TatKey,
        expect_present: bool,
        entry: TatEntry,
        now_ms: i64,
    ) -> bool {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let present = Self::max_live_entry(&chitchat, &chitchat_key, now_ms).is_some();
        if present != expect_present {
            debug!(
                key = %chitchat_key,
                expect_present,
                "Conditional cluster write rejected"
            );
            return false;
        }

        chitchat
            .self_node_state()
            .set(&chitchat_key, entry.encode());

        debug!(
            key = %chitchat_key,
            tat = entry.tat,
            expires_at_ms = entry.expires_at_ms,
            "Published arrival time"
        );

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            Self::delete_expired(&mut chitchat, now_ms);
        }

        true
    }

    /// Tombstone every entry this node published that has expired by
    /// `now_ms`, returning how many were deleted.
    ///
    /// Chitchat drops tombstones once the deletion grace period has passed.
    pub async fn purge_expired(&self, now_ms: i64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        Self::delete_expired(&mut chitchat, now_ms)
    }

    fn delete_expired(chitchat: &mut chitchat::Chitchat, now_ms: i64) -> usize {
        let node_state = chitchat.self_node_state();
        let expired: Vec<String> = node_state
            .iter_prefix(TatKey::PREFIX)
            .filter(|(_, versioned)| {
                TatEntry::decode(&versioned.value).map_or(true, |entry| !entry.is_live(now_ms))
            })
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &expired {
            node_state.delete(key);
        }

        if !expired.is_empty() {
            debug!(deleted = expired.len(), "Deleted expired arrival times");
        }
        expired.len()
    }

    fn max_live_entry(
        chitchat: &chitchat::Chitchat,
        key: &str,
        now_ms: i64,
    ) -> Option<TatEntry> {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|node_state| node_state.get(key).and_then(|v| TatEntry::decode(v)))
            .filter(|entry| entry.is_live(now_ms))
            .max_by_key(|entry| entry.tat)
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
