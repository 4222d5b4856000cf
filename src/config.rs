//! Configuration management for throttle.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::mesh::ClusterConfig;
use crate::policy::{PolicyEvaluator, ThrottlePolicy};

/// Main configuration for throttling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleOptions {
    /// Throttle every endpoint, not only those carrying their own quota
    #[serde(default)]
    pub enable_global_filter: bool,

    /// Keep limiter state in the gossip mesh instead of process memory
    #[serde(default)]
    pub use_distributed: bool,

    /// The throttle policy
    #[serde(default)]
    pub policy: ThrottlePolicy,

    /// Mesh configuration, used when `use_distributed` is set
    #[serde(default)]
    pub mesh: MeshConfig,
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Unique node identifier; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_mesh_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; the listen address when unset
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers to bootstrap membership from
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers sharing this identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Grace period before a dead node's state is dropped, in seconds
    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_mesh_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
        }
    }
}

fn default_mesh_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "throttle".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

impl MeshConfig {
    /// Build the cluster configuration for this node.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

impl ThrottleOptions {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ThrottleError::Config(e.to_string()))
    }

    /// Check the configuration, compiling the policy.
    ///
    /// Malformed IP ranges surface here as format errors rather than during
    /// request handling.
    pub fn validate(&self) -> Result<PolicyEvaluator> {
        if self.mesh.gossip_interval_ms == 0 {
            return Err(ThrottleError::Config(
                "mesh.gossip_interval_ms must be greater than zero".to_string(),
            ));
        }

        for (section, rules) in [
            ("ip_rules", &self.policy.ip_rules),
            ("user_agent_rules", &self.policy.user_agent_rules),
            ("path_rules", &self.policy.path_rules),
        ] {
            for (key, quota) in rules {
                if quota.max_burst > 0 && quota.max_rate < 1 {
                    return Err(ThrottleError::Config(format!(
                        "{}['{}']: max_rate must be at least 1 when max_burst is set",
                        section, key
                    )));
                }
            }
        }

        PolicyEvaluator::new(self.policy.clone())
    }
}
