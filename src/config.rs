//! Testbed configuration: what to extract, how to cluster, where to replay.

use crate::clustering::HostPair;
use crate::features::SplitBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    /// Capture files fed to one batch
    pub captures: Vec<PathBuf>,
    /// Feature extraction parameters
    pub features: FeaturesConfig,
    /// Strategies and host pairs
    pub clustering: ClusteringConfig,
    /// Replay engine settings
    pub replay: ReplayConfig,
    /// External program locations
    pub tools: ToolsConfig,
    /// Emulated hosts reachable by the binary
    pub network: NetworkConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Split each capture before extraction
    pub split: bool,
    /// Split by 4-tuple flow instead of endpoint IP pair
    pub by_flow: bool,
    /// Upper bound of sub-captures per capture (0 = unlimited)
    pub file_limit: usize,
    /// Packets read per capture (0 = unlimited)
    pub packet_limit: usize,
    pub splitter: SplitBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Strategy names, e.g. "K-means", "DBSCAN"
    pub strategies: Vec<String>,
    /// Index → host pair; the pair count is the target cluster count
    pub host_pairs: BTreeMap<usize, HostPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Provision and replay after clustering (binary only)
    pub enabled: bool,
    /// Liveness poll of the replay process (milliseconds)
    pub poll_interval_ms: u64,
    /// First two octets of the veth subnets, e.g. "4.4"
    pub subnet_prefix: String,
    /// MTU of the outer veth end
    pub outer_mtu: u32,
    /// Launch the replayer through sudo
    pub use_sudo: bool,
    /// 1-based scenario indices to replay (empty = all)
    pub scenarios: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ip: String,
    pub splitter: String,
    pub tcpprep: String,
    pub tcprewrite: String,
    pub tcpreplay: String,
    /// Traffic control, run inside the host namespace
    pub tc: String,
    pub iptables: String,
    /// Enters a host namespace by PID
    pub nsenter: String,
    pub sudo: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub ip: String,
    pub mac: String,
    /// PID of a process inside the host's network namespace
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            split: true,
            by_flow: false,
            file_limit: 0,
            packet_limit: 0,
            splitter: SplitBackend::External,
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            strategies: vec!["K-means".to_string()],
            host_pairs: BTreeMap::new(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 1000,
            subnet_prefix: "4.4".to_string(),
            outer_mtu: 65535,
            use_sudo: true,
            scenarios: Vec::new(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ip: "ip".to_string(),
            splitter: "tools/PcapSplitter".to_string(),
            tcpprep: "tcpprep".to_string(),
            tcprewrite: "tcprewrite".to_string(),
            tcpreplay: "tcpreplay".to_string(),
            tc: "tc".to_string(),
            iptables: "iptables".to_string(),
            nsenter: "nsenter".to_string(),
            sudo: "sudo".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl TestbedConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<TestbedConfig>(&data) {
                    Ok(c) => return c,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "invalid config; using defaults")
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable config; using defaults")
                }
            }
        }
        Self::default()
    }
}
