//! Generates configuration for a local test network.
//!
//! Layout under the output directory:
//!
//! ```text
//! node0/config/node-config.toml
//! node0/run/
//! ...
//! client0/config/client-config.toml
//! ...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use tracing::info;

use crate::config::{
    BootstrapParameters, CLIENT_CONFIG_FILE, ClientConfig, ClientPeer, NODE_CONFIG_FILE,
    NodeConfig, NodePeer, RuntimeConfig,
};
use crate::handshake::Identity;

#[derive(Debug, Clone)]
pub struct LocalNetwork {
    pub nodes: u64,
    pub clients: u64,
    pub host: String,
    /// Node `i` listens on `base_port + i`.
    pub base_port: u16,
    pub runtime: RuntimeConfig,
    pub bootstrap: BootstrapParameters,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self {
            nodes: 4,
            clients: 1,
            host: "127.0.0.1".to_string(),
            base_port: 7000,
            runtime: RuntimeConfig::default(),
            bootstrap: BootstrapParameters::default(),
        }
    }
}

pub fn node_dir(root: &Path, id: u64) -> PathBuf {
    root.join(format!("node{id}"))
}

pub fn node_config_path(root: &Path, id: u64) -> PathBuf {
    node_dir(root, id).join("config").join(NODE_CONFIG_FILE)
}

pub fn node_run_dir(root: &Path, id: u64) -> PathBuf {
    node_dir(root, id).join("run")
}

pub fn client_config_path(root: &Path, id: u64) -> PathBuf {
    root.join(format!("client{id}"))
        .join("config")
        .join(CLIENT_CONFIG_FILE)
}

impl LocalNetwork {
    /// Writes a fresh network into `root`, which must be missing or empty.
    pub fn generate(&self, root: &Path) -> Result<()> {
        ensure!(self.nodes > 0, "a network needs at least one node");
        ensure_empty(root)?;

        let node_keys: Vec<Identity> = (0..self.nodes).map(|_| Identity::generate()).collect();
        let client_keys: Vec<Identity> = (0..self.clients).map(|_| Identity::generate()).collect();

        let mut nodes = Vec::with_capacity(node_keys.len());
        for (id, identity) in (0u64..).zip(&node_keys) {
            let port = u64::from(self.base_port) + id;
            ensure!(
                port <= u64::from(u16::MAX),
                "port range exhausted at node {id}"
            );
            nodes.push(NodePeer {
                id,
                address: format!("{}:{port}", self.host),
                public_key: hex::encode(identity.public_key()),
            });
        }
        let clients: Vec<ClientPeer> = (0u64..)
            .zip(&client_keys)
            .map(|(id, identity)| ClientPeer {
                id,
                public_key: hex::encode(identity.public_key()),
            })
            .collect();

        for (node, identity) in nodes.iter().zip(&node_keys) {
            let config = NodeConfig {
                id: node.id,
                listen_address: node.address.clone(),
                private_key: identity.to_hex(),
                runtime: self.runtime.clone(),
                bootstrap: self.bootstrap.clone(),
                nodes: nodes.clone(),
                clients: clients.clone(),
            };
            config.save(&node_config_path(root, node.id))?;
            let run_dir = node_run_dir(root, node.id);
            fs::create_dir_all(&run_dir)
                .with_context(|| format!("failed to create {}", run_dir.display()))?;
        }

        for (client, identity) in clients.iter().zip(&client_keys) {
            let config = ClientConfig {
                id: client.id,
                private_key: identity.to_hex(),
                nodes: nodes.clone(),
            };
            config.save(&client_config_path(root, client.id))?;
        }

        info!(
            nodes = self.nodes,
            clients = self.clients,
            dir = %root.display(),
            "generated local network"
        );
        Ok(())
    }
}

fn ensure_empty(root: &Path) -> Result<()> {
    if !root.exists() {
        return fs::create_dir_all(root)
            .with_context(|| format!("failed to create {}", root.display()));
    }
    let mut entries =
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;
    if entries.next().is_some() {
        bail!("{} is not empty", root.display());
    }
    Ok(())
}
