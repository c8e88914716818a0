//! TOML configuration for nodes and clients.
//!
//! A node reads `node-config.toml`, a client reads `client-config.toml`;
//! both are written by `replica bootstrap`. Keys are hex encoded: the private
//! key is a 32-byte ed25519 secret, public keys are 32-byte ed25519 points.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::directory::{PeerDirectory, PeerRecord, parse_public_key};
use crate::engine::{ClientState, NetworkConfig, NetworkState};
use crate::handshake::Identity;
use crate::raft_engine::EngineConfig;

pub const NODE_CONFIG_FILE: &str = "node-config.toml";
pub const CLIENT_CONFIG_FILE: &str = "client-config.toml";

/// A node as listed in every config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePeer {
    pub id: u64,
    /// `host:port` other peers dial.
    pub address: String,
    /// Hex encoded ed25519 public key.
    pub public_key: String,
}

/// A client a node accepts requests from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPeer {
    pub id: u64,
    pub public_key: String,
}

/// Driver and engine timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_interval_ms: u64,
    pub heartbeat_ticks: u32,
    pub suspect_ticks: u32,
    pub epoch_change_timeout_ticks: u32,
    pub batch_size: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            heartbeat_ticks: 1,
            suspect_ticks: 4,
            epoch_change_timeout_ticks: 8,
            batch_size: 20,
        }
    }
}

/// Parameters fixed into the network state at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapParameters {
    pub number_of_buckets: u32,
    pub client_window_size: u32,
    pub checkpoint_interval: u32,
}

impl Default for BootstrapParameters {
    fn default() -> Self {
        Self {
            number_of_buckets: 1,
            client_window_size: 5000,
            checkpoint_interval: 20,
        }
    }
}

/// Contents of `node-config.toml`.
///
/// `nodes` must list this node too, and ids must be unique within `nodes`
/// and within `clients`. Every node of a network must agree on both lists
/// and on `bootstrap`, since those seed the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u64,
    /// Address to bind; may differ from the advertised one in `nodes`.
    pub listen_address: String,
    /// Hex encoded ed25519 secret key.
    pub private_key: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub bootstrap: BootstrapParameters,
    pub nodes: Vec<NodePeer>,
    #[serde(default)]
    pub clients: Vec<ClientPeer>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(path, self)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.nodes.iter().any(|node| node.id == self.id),
            "node {} is missing from its own node list",
            self.id
        );
        ensure!(
            self.runtime.tick_interval_ms > 0,
            "tick_interval_ms must be positive"
        );
        Ok(())
    }

    pub fn identity(&self) -> Result<Identity> {
        Identity::from_hex(&self.private_key)
            .with_context(|| format!("invalid private key for node {}", self.id))
    }

    /// Builds the peer directory; every key and address is checked here.
    pub fn directory(&self) -> Result<Arc<PeerDirectory>> {
        build_directory(&self.nodes, &self.clients)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.runtime.tick_interval_ms)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            node_id: self.id,
            heartbeat_ticks: self.runtime.heartbeat_ticks,
            suspect_ticks: self.runtime.suspect_ticks,
            epoch_change_timeout_ticks: self.runtime.epoch_change_timeout_ticks,
            batch_size: self.runtime.batch_size,
        }
    }

    /// Network state a freshly bootstrapped node starts from.
    pub fn initial_network_state(&self) -> NetworkState {
        let mut nodes: Vec<u64> = self.nodes.iter().map(|node| node.id).collect();
        nodes.sort_unstable();
        let mut clients: Vec<ClientState> = self
            .clients
            .iter()
            .map(|client| ClientState::new(client.id, self.bootstrap.client_window_size))
            .collect();
        clients.sort_by_key(|client| client.id);
        NetworkState {
            config: NetworkConfig {
                nodes,
                number_of_buckets: self.bootstrap.number_of_buckets,
                checkpoint_interval: self.bootstrap.checkpoint_interval,
            },
            clients,
        }
    }
}

/// Contents of `client-config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: u64,
    pub private_key: String,
    pub nodes: Vec<NodePeer>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(path, self)
    }

    pub fn identity(&self) -> Result<Identity> {
        Identity::from_hex(&self.private_key)
            .with_context(|| format!("invalid private key for client {}", self.id))
    }

    pub fn directory(&self) -> Result<Arc<PeerDirectory>> {
        build_directory(&self.nodes, &[])
    }
}

fn build_directory(nodes: &[NodePeer], clients: &[ClientPeer]) -> Result<Arc<PeerDirectory>> {
    let nodes = nodes
        .iter()
        .map(|node| {
            let key = parse_public_key(&node.public_key)
                .map_err(|reason| anyhow::anyhow!("node {}: {reason}", node.id))?;
            Ok(PeerRecord::node(node.id, node.address.clone(), key))
        })
        .collect::<Result<Vec<_>>>()?;
    let clients = clients
        .iter()
        .map(|client| {
            let key = parse_public_key(&client.public_key)
                .map_err(|reason| anyhow::anyhow!("client {}: {reason}", client.id))?;
            Ok(PeerRecord::client(client.id, key))
        })
        .collect::<Result<Vec<_>>>()?;
    let directory = PeerDirectory::new(nodes, clients).context("invalid peer configuration")?;
    Ok(Arc::new(directory))
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(value).context("failed to render config")?;
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}
