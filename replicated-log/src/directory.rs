//! Static peer directory.
//!
//! Every participant knows the full membership up front: node peers (with a
//! listen address) and client peers (which never listen). The directory maps
//! logical ids to addresses and authentication keys, and maps an
//! authenticated public key back to `(id, class)` for inbound connections.
//!
//! The directory is built once from configuration and is read-only
//! afterwards, so it is shared behind an `Arc` without any locking.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

/// Raw ed25519 public key bytes.
pub type PublicKey = [u8; 32];

/// Which peer set an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerClass {
    Node,
    Client,
}

impl fmt::Display for PeerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerClass::Node => f.write_str("node"),
            PeerClass::Client => f.write_str("client"),
        }
    }
}

/// One configured peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: u64,
    /// Listen address; `None` for clients.
    pub address: Option<String>,
    pub public_key: PublicKey,
}

impl PeerRecord {
    pub fn node(id: u64, address: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id,
            address: Some(address.into()),
            public_key,
        }
    }

    pub fn client(id: u64, public_key: PublicKey) -> Self {
        Self {
            id,
            address: None,
            public_key,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("malformed public key for {class} {id}: {reason}")]
    MalformedKey {
        class: PeerClass,
        id: u64,
        reason: String,
    },
    #[error("duplicate {class} id {id}")]
    DuplicateId { class: PeerClass, id: u64 },
    #[error("duplicate address {address} for node {id}")]
    DuplicateAddress { id: u64, address: String },
    #[error("node {id} has no listen address")]
    MissingAddress { id: u64 },
    #[error("public key of {class} {id} is already assigned to {other_class} {other_id}")]
    DuplicateKey {
        class: PeerClass,
        id: u64,
        other_class: PeerClass,
        other_id: u64,
    },
}

/// Decodes a hex encoded ed25519 public key and checks that it is a valid
/// curve point.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey, String> {
    let bytes = hex::decode(hex_key.trim()).map_err(|err| format!("invalid hex: {err}"))?;
    let key: PublicKey = bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))?;
    VerifyingKey::from_bytes(&key).map_err(|err| format!("not an ed25519 point: {err}"))?;
    Ok(key)
}

/// Identity index over the node and client peer sets.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    nodes: Vec<PeerRecord>,
    clients: Vec<PeerRecord>,
    address_by_id: HashMap<u64, String>,
    by_key: HashMap<PublicKey, (u64, PeerClass)>,
}

impl PeerDirectory {
    /// Builds the index, rejecting malformed keys, duplicated ids, addresses
    /// or keys, and keys that appear in both classes.
    pub fn new(nodes: Vec<PeerRecord>, clients: Vec<PeerRecord>) -> Result<Self, DirectoryError> {
        let mut address_by_id = HashMap::new();
        let mut by_key: HashMap<PublicKey, (u64, PeerClass)> = HashMap::new();
        let mut seen_addresses: HashMap<String, u64> = HashMap::new();

        for (class, records) in [(PeerClass::Node, &nodes), (PeerClass::Client, &clients)] {
            let mut ids = HashMap::new();
            for record in records {
                if ids.insert(record.id, ()).is_some() {
                    return Err(DirectoryError::DuplicateId {
                        class,
                        id: record.id,
                    });
                }
                VerifyingKey::from_bytes(&record.public_key).map_err(|err| {
                    DirectoryError::MalformedKey {
                        class,
                        id: record.id,
                        reason: err.to_string(),
                    }
                })?;
                if let Some(&(other_id, other_class)) = by_key.get(&record.public_key) {
                    return Err(DirectoryError::DuplicateKey {
                        class,
                        id: record.id,
                        other_class,
                        other_id,
                    });
                }
                by_key.insert(record.public_key, (record.id, class));

                if class == PeerClass::Node {
                    let address = record
                        .address
                        .clone()
                        .ok_or(DirectoryError::MissingAddress { id: record.id })?;
                    if seen_addresses.insert(address.clone(), record.id).is_some() {
                        return Err(DirectoryError::DuplicateAddress {
                            id: record.id,
                            address,
                        });
                    }
                    address_by_id.insert(record.id, address);
                }
            }
        }

        Ok(Self {
            nodes,
            clients,
            address_by_id,
            by_key,
        })
    }

    /// Maps an authenticated public key back to its logical identity.
    pub fn resolve(&self, key: &PublicKey) -> Option<(u64, PeerClass)> {
        self.by_key.get(key).copied()
    }

    /// Listen address of a node peer.
    pub fn address_of(&self, id: u64) -> Option<&str> {
        self.address_by_id.get(&id).map(String::as_str)
    }

    pub fn public_key_of(&self, class: PeerClass, id: u64) -> Option<&PublicKey> {
        let records = match class {
            PeerClass::Node => &self.nodes,
            PeerClass::Client => &self.clients,
        };
        records
            .iter()
            .find(|record| record.id == id)
            .map(|record| &record.public_key)
    }

    pub fn nodes(&self) -> &[PeerRecord] {
        &self.nodes
    }

    pub fn clients(&self) -> &[PeerRecord] {
        &self.clients
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.iter().map(|record| record.id).collect();
        ids.sort_unstable();
        ids
    }

    /// Client ids in ascending order.
    pub fn client_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.iter().map(|record| record.id).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn key() -> PublicKey {
        SigningKey::generate(&mut OsRng).verifying_key().to_bytes()
    }

    fn nodes(n: u64) -> Vec<PeerRecord> {
        (0..n)
            .map(|id| PeerRecord::node(id, format!("127.0.0.1:{}", 7000 + id), key()))
            .collect()
    }

    #[test]
    fn test_resolve_round_trips_every_identity() -> anyhow::Result<()> {
        let nodes = nodes(4);
        let clients: Vec<PeerRecord> = (0..2).map(|id| PeerRecord::client(id, key())).collect();
        let directory = PeerDirectory::new(nodes.clone(), clients.clone())?;

        for record in &nodes {
            assert_eq!(
                directory.resolve(&record.public_key),
                Some((record.id, PeerClass::Node))
            );
            assert_eq!(directory.address_of(record.id), record.address.as_deref());
        }
        for record in &clients {
            assert_eq!(
                directory.resolve(&record.public_key),
                Some((record.id, PeerClass::Client))
            );
        }
        assert_eq!(directory.resolve(&key()), None);
        assert_eq!(directory.node_ids(), vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut nodes = nodes(2);
        nodes[1].address = nodes[0].address.clone();
        let err = PeerDirectory::new(nodes, vec![]).unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateAddress { id: 1, .. }));
    }

    #[test]
    fn test_duplicate_key_rejected_within_class() {
        let mut nodes = nodes(3);
        nodes[2].public_key = nodes[0].public_key;
        let err = PeerDirectory::new(nodes, vec![]).unwrap_err();
        assert!(matches!(
            err,
            DirectoryError::DuplicateKey {
                id: 2,
                other_id: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_key_in_both_classes_rejected() {
        let nodes = nodes(2);
        let clients = vec![PeerRecord::client(0, nodes[1].public_key)];
        let err = PeerDirectory::new(nodes, clients).unwrap_err();
        assert_eq!(
            err,
            DirectoryError::DuplicateKey {
                class: PeerClass::Client,
                id: 0,
                other_class: PeerClass::Node,
                other_id: 1,
            }
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut nodes = nodes(2);
        nodes[1].id = 0;
        let err = PeerDirectory::new(nodes, vec![]).unwrap_err();
        assert_eq!(
            err,
            DirectoryError::DuplicateId {
                class: PeerClass::Node,
                id: 0
            }
        );
    }

    #[test]
    fn test_parse_public_key_validates_length() {
        let good = hex::encode(key());
        assert!(parse_public_key(&good).is_ok());
        assert!(parse_public_key("abcd").unwrap_err().contains("expected 32 bytes"));
        assert!(parse_public_key("zz").unwrap_err().contains("invalid hex"));
    }
}
