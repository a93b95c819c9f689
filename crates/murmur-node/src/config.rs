//! Configuration types for murmur-node.
//! Parsed from ~/.murmur/config.toml.

use murmur_gossip::GossipConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub gossip: GossipSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Peer-checked cluster name; mismatched peers are ignored.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Peer-checked partitioner name; empty means "don't check".
    #[serde(default)]
    pub partitioner: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Canonical address advertised to peers. Defaults to the bound listen
    /// address; must be set when listening on a wildcard address.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    /// State replica count. 0 means one per available core.
    #[serde(default)]
    pub shards: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            partitioner: String::new(),
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            database: default_database(),
            api_addr: default_api_addr(),
            shards: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipSection {
    /// Initial contact addresses.
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_ring_delay_ms")]
    pub ring_delay_ms: u64,
    #[serde(default = "default_fd_timeout_ms")]
    pub failure_detector_timeout_in_ms: u64,
    #[serde(default = "default_shadow_round_ms")]
    pub shadow_round_ms: u64,
    #[serde(default = "default_shutdown_announce_ms")]
    pub shutdown_announce_in_ms: u64,
    /// 0 bypasses the settle wait, positive caps the poll count, negative
    /// means default (wait until settled).
    #[serde(default = "default_skip_settle")]
    pub skip_wait_for_gossip_to_settle: i32,
    /// If > 0, overrides the startup generation.
    #[serde(default)]
    pub force_gossip_generation: i32,
    #[serde(default = "default_true")]
    pub advertise_myself: bool,
    /// Feature names published under SUPPORTED_FEATURES.
    #[serde(default)]
    pub features: Vec<String>,
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            ring_delay_ms: default_ring_delay_ms(),
            failure_detector_timeout_in_ms: default_fd_timeout_ms(),
            shadow_round_ms: default_shadow_round_ms(),
            shutdown_announce_in_ms: default_shutdown_announce_ms(),
            skip_wait_for_gossip_to_settle: default_skip_settle(),
            force_gossip_generation: 0,
            advertise_myself: true,
            features: Vec::new(),
        }
    }
}

// Default value functions
fn default_cluster_name() -> String {
    "murmur".into()
}
fn default_listen_addr() -> String {
    "127.0.0.1:7900".into()
}
fn default_database() -> String {
    "~/.murmur/murmur.db".into()
}
fn default_api_addr() -> String {
    "127.0.0.1:7973".into()
}
fn default_ring_delay_ms() -> u64 {
    30_000
}
fn default_fd_timeout_ms() -> u64 {
    20_000
}
fn default_shadow_round_ms() -> u64 {
    300_000
}
fn default_shutdown_announce_ms() -> u64 {
    2_000
}
fn default_skip_settle() -> i32 {
    -1
}
fn default_true() -> bool {
    true
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults when missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolved seed addresses; unresolvable entries are logged and skipped.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        self.gossip
            .seeds
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!(seed = %s, "config: skipping unparsable seed");
                    None
                }
            })
            .collect()
    }

    /// Effective shard count.
    pub fn shard_count(&self) -> usize {
        if self.node.shards > 0 {
            self.node.shards
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Gossip-core config derived from the file sections.
    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            cluster_name: self.node.cluster_name.clone(),
            partitioner: self.node.partitioner.clone(),
            seeds: self.seed_addrs(),
            ring_delay: Duration::from_millis(self.gossip.ring_delay_ms),
            failure_detector_timeout: Duration::from_millis(
                self.gossip.failure_detector_timeout_in_ms,
            ),
            shadow_round_timeout: Duration::from_millis(self.gossip.shadow_round_ms),
            shutdown_announce: Duration::from_millis(self.gossip.shutdown_announce_in_ms),
            skip_wait_for_gossip_to_settle: self.gossip.skip_wait_for_gossip_to_settle,
            force_gossip_generation: self.gossip.force_gossip_generation,
            advertise_myself: self.gossip.advertise_myself,
            shards: self.shard_count(),
            ..GossipConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node.cluster_name, "murmur");
        assert_eq!(cfg.gossip.ring_delay_ms, 30_000);
        assert_eq!(cfg.gossip.skip_wait_for_gossip_to_settle, -1);
        assert!(cfg.gossip.advertise_myself);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[node]
cluster_name = "prod-west"
partitioner = "murmur.Partitioner"
listen_addr = "10.0.0.5:7900"
api_addr = "127.0.0.1:7973"
shards = 4

[gossip]
seeds = ["10.0.0.1:7900", "10.0.0.2:7900"]
ring_delay_ms = 15000
failure_detector_timeout_in_ms = 25000
force_gossip_generation = 0
features = ["range-tombstones", "cdc"]
"#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.node.cluster_name, "prod-west");
        assert_eq!(cfg.node.shards, 4);
        assert_eq!(cfg.seed_addrs().len(), 2);
        assert_eq!(cfg.gossip.features.len(), 2);

        let gossip = cfg.gossip_config();
        assert_eq!(gossip.ring_delay, Duration::from_millis(15_000));
        assert_eq!(gossip.cluster_name, "prod-west");
        assert_eq!(gossip.partitioner, "murmur.Partitioner");
    }

    #[test]
    fn test_unparsable_seed_is_skipped() {
        let toml_str = r#"
[gossip]
seeds = ["not-an-addr", "10.0.0.1:7900"]
"#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.seed_addrs(), vec!["10.0.0.1:7900".parse().unwrap()]);
    }

    #[test]
    fn test_serialise_default() {
        let cfg = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("cluster_name"));
    }
}
