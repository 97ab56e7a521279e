//! Runtime configuration and cluster membership parsing.

use log::warn;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, ServerError};

/// One cluster member as written in the nodes configuration:
/// `ip:peering_port:api_port`. The peering port carries consensus traffic,
/// the api port is where clients (and the forwarder) talk HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTriple {
    pub host: String,
    pub peering_port: u16,
    pub api_port: u16,
}

impl NodeTriple {
    pub fn peering_url(&self) -> String {
        format!("http://{}:{}", self.host, self.peering_port)
    }

    pub fn api_origin(&self, scheme: &str) -> String {
        format!("{}://{}:{}", scheme, self.host, self.api_port)
    }
}

impl fmt::Display for NodeTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.peering_port, self.api_port)
    }
}

/// Ordered cluster membership. A node's raft id is its 1-based position in
/// this list, so all members must agree on the ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    nodes: Vec<NodeTriple>,
}

impl ClusterConfig {
    /// Parse a `ip:port:port[,ip:port:port]*` string. An empty string is
    /// substituted with the local node's own triple so that a single node
    /// can boot without any configuration.
    pub fn parse(nodes: &str, local: &NodeTriple) -> Result<ClusterConfig> {
        if nodes.trim().is_empty() {
            return Ok(ClusterConfig {
                nodes: vec![local.clone()],
            });
        }

        let mut parsed = Vec::new();
        for part in nodes.split(',') {
            let tokens: Vec<&str> = part.trim().split(':').collect();
            if tokens.len() != 3 {
                return Err(ServerError::Config(format!(
                    "expected ip:peering_port:api_port, got `{}`",
                    part
                )));
            }
            let peering_port = tokens[1]
                .parse::<u16>()
                .map_err(|_| ServerError::Config(format!("bad peering port in `{}`", part)))?;
            let api_port = tokens[2]
                .parse::<u16>()
                .map_err(|_| ServerError::Config(format!("bad api port in `{}`", part)))?;
            parsed.push(NodeTriple {
                host: tokens[0].to_string(),
                peering_port,
                api_port,
            });
        }

        Ok(ClusterConfig { nodes: parsed })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Raft ids are 1-based positions in the configured ordering.
    pub fn node_ids(&self) -> Vec<u64> {
        (1..=self.nodes.len() as u64).collect()
    }

    pub fn id_of(&self, local: &NodeTriple) -> Option<u64> {
        self.nodes
            .iter()
            .position(|n| n == local)
            .map(|p| p as u64 + 1)
    }

    pub fn get(&self, id: u64) -> Option<&NodeTriple> {
        if id == 0 {
            return None;
        }
        self.nodes.get(id as usize - 1)
    }

    pub fn nodes(&self) -> &[NodeTriple] {
        &self.nodes
    }
}

impl fmt::Display for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.nodes.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Runtime configuration for a seekdb server process.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Address other cluster members reach this node on.
    pub peering_address: String,
    /// Port for consensus traffic.
    pub peering_port: u16,
    /// Port the HTTP API listens on; also the node disambiguator.
    pub api_port: u16,
    /// Address the metrics endpoint binds to.
    pub metrics_addr: String,
    /// Directory holding the consensus log, meta and snapshots.
    pub raft_dir: PathBuf,
    /// Directory holding the live key-value store.
    pub state_dir: PathBuf,
    /// Comma-separated `ip:peering_port:api_port` triples; empty means
    /// single-node with the local endpoint.
    pub nodes: String,
    pub election_timeout_ms: u64,
    pub snapshot_interval_s: u64,
    /// First-boot migration: let the elected leader snapshot a pre-existing
    /// stand-alone database instead of wiping it.
    pub create_init_db_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            peering_address: "127.0.0.1".to_string(),
            peering_port: 8107,
            api_port: 8108,
            metrics_addr: "0.0.0.0:8118".to_string(),
            raft_dir: PathBuf::from("./data/raft"),
            state_dir: PathBuf::from("./data/state"),
            nodes: String::new(),
            election_timeout_ms: 1000,
            snapshot_interval_s: 3600,
            create_init_db_snapshot: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(path: &str) -> RuntimeConfig {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("could not read config file {}: {:?}, using defaults", path, e);
                return RuntimeConfig::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!("could not parse config file {}: {:?}, using defaults", path, e);
                RuntimeConfig::default()
            }
        }
    }

    pub fn local_triple(&self) -> NodeTriple {
        NodeTriple {
            host: self.peering_address.clone(),
            peering_port: self.peering_port,
            api_port: self.api_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> NodeTriple {
        NodeTriple {
            host: "10.0.0.5".into(),
            peering_port: 8107,
            api_port: 8108,
        }
    }

    #[test]
    fn test_parse_multi_node() {
        let conf = ClusterConfig::parse(
            "10.0.0.5:8107:8108,10.0.0.6:8107:8108,10.0.0.7:8107:8108",
            &local(),
        )
        .unwrap();
        assert_eq!(conf.len(), 3);
        assert_eq!(conf.node_ids(), vec![1, 2, 3]);
        assert_eq!(conf.id_of(&local()), Some(1));
        assert_eq!(conf.get(2).unwrap().host, "10.0.0.6");
        assert_eq!(conf.get(0), None);
        assert_eq!(conf.get(9), None);
    }

    #[test]
    fn test_empty_config_substitutes_local_node() {
        let conf = ClusterConfig::parse("", &local()).unwrap();
        assert_eq!(conf.len(), 1);
        assert_eq!(conf.id_of(&local()), Some(1));
        assert_eq!(conf.to_string(), "10.0.0.5:8107:8108");
    }

    #[test]
    fn test_parse_rejects_malformed_triple() {
        assert!(ClusterConfig::parse("10.0.0.5:8107", &local()).is_err());
        assert!(ClusterConfig::parse("10.0.0.5:x:8108", &local()).is_err());
        assert!(ClusterConfig::parse("10.0.0.5:8107:y", &local()).is_err());
    }

    #[test]
    fn test_api_origin_for_forwarding() {
        let conf = ClusterConfig::parse("10.0.0.5:8107:9200", &local()).unwrap();
        assert_eq!(conf.get(1).unwrap().api_origin("http"), "http://10.0.0.5:9200");
        assert_eq!(conf.get(1).unwrap().peering_url(), "http://10.0.0.5:8107");
    }
}
