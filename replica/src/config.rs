use std::collections::{HashMap, HashSet};

use anyhow::Context;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;

use crate::error::Error;
use crate::tob::NodeId;

static INSTANCE: OnceCell<RuntimeConfig> = OnceCell::new();

/// The config loaded at startup.
pub fn instance() -> Option<&'static RuntimeConfig> {
    INSTANCE.get()
}

/// Stores `config` as the process-wide config. Only the first call wins.
pub fn init(config: RuntimeConfig) -> &'static RuntimeConfig {
    INSTANCE.get_or_init(|| config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: String,
    /// Listener for peer nodes
    pub addr: String,
    #[serde(default = "default_client_addr")]
    pub client_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    /// Static membership; the order decides the leader.
    pub node_list: Vec<NodeConfig>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    pub restore_from: Option<String>,
}

fn default_client_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:4010".to_string()
}

fn default_keyspace() -> String {
    "demo".to_string()
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

impl RuntimeConfig {
    pub fn from_toml(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config {}", path))?;
        Self::parse(&contents).with_context(|| format!("invalid runtime config {}", path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: RuntimeConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Checks the membership list and this node's place in it.
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_list.is_empty() {
            return Err(Error::Config("node_list is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for node in &self.node_list {
            if !seen.insert(node.id.as_str()) {
                return Err(Error::Config(format!("duplicate node id {}", node.id)));
            }
        }
        if !seen.contains(self.id.as_str()) {
            return Err(Error::Config(format!("{} is not in node_list", self.id)));
        }
        Ok(())
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.node_list
            .iter()
            .map(|n| NodeId::from(n.id.clone()))
            .collect()
    }

    pub fn peer_addrs(&self) -> HashMap<NodeId, String> {
        self.node_list
            .iter()
            .map(|n| (NodeId::from(n.id.clone()), n.addr.clone()))
            .collect()
    }
}
