//! Trust registry and long-term key material.
//!
//! Every node carries an ed25519 identity keypair. The mesh-wide whitelist
//! (the "trust file") maps node ids to public identity keys in bs58 text
//! form; it is read once at boot and from then on mutated only by
//! revocation, which is irreversible within a run.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::types::NodeId;

/// A node's public identity key in bs58 text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    /// Encode a verifying key into its text form.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(bs58::encode(key.as_bytes()).into_string())
    }

    /// Decode the text form back into a verifying key.
    pub fn verifying_key(&self) -> MeshResult<VerifyingKey> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| MeshError::Crypto(format!("bad public key text: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MeshError::Crypto("public key has wrong length".to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| MeshError::Crypto(format!("bad public key: {e}")))
    }

    /// The raw text form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The local node's identity as stored on disk:
/// `{node_id, public, private}` with keys in bs58 text form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// The node this identity belongs to
    pub node_id: NodeId,
    /// Public identity key
    pub public: PublicKey,
    /// Private identity key (keep on disk with restrictive permissions)
    pub private: String,
}

impl NodeIdentity {
    /// Build an identity from a freshly generated signing key.
    pub fn from_signing_key(node_id: NodeId, key: &SigningKey) -> Self {
        Self {
            node_id,
            public: PublicKey::from_verifying_key(&key.verifying_key()),
            private: bs58::encode(key.to_bytes()).into_string(),
        }
    }

    /// Load an identity file. A missing or malformed file is a boot
    /// failure for the node that needs it.
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .map_err(|e| MeshError::Boot(format!("cannot read identity file {}: {e}", path.display())))?;
        serde_json::from_slice(&raw)
            .map_err(|e| MeshError::Boot(format!("malformed identity file {}: {e}", path.display())))
    }

    /// Write the identity file as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> MeshResult<()> {
        std::fs::write(path.as_ref(), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Decode the private key text into a signing key.
    pub fn signing_key(&self) -> MeshResult<SigningKey> {
        let bytes = bs58::decode(&self.private)
            .into_vec()
            .map_err(|e| MeshError::Crypto(format!("bad private key text: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MeshError::Crypto("private key has wrong length".to_string()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }
}

/// In-memory whitelist of node identities.
///
/// Reads on the handshake hot path and revocations both go through one
/// mutex, held only around the map operation and never across I/O.
pub struct TrustRegistry {
    entries: Mutex<BTreeMap<NodeId, PublicKey>>,
}

impl TrustRegistry {
    /// Load the registry from the signed trust file: a JSON object mapping
    /// node id to public key text.
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .map_err(|e| MeshError::Boot(format!("cannot read trust file {}: {e}", path.display())))?;
        let entries: BTreeMap<NodeId, PublicKey> = serde_json::from_slice(&raw)
            .map_err(|e| MeshError::Boot(format!("malformed trust file {}: {e}", path.display())))?;
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Build a registry from an in-memory map.
    pub fn from_entries(entries: BTreeMap<NodeId, PublicKey>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// The public key registered for `node`, if any.
    pub fn key_for(&self, node: &NodeId) -> Option<PublicKey> {
        self.entries.lock().expect("trust registry poisoned").get(node).cloned()
    }

    /// Reverse lookup: the node id whose registered key is exactly `key`.
    /// This is the handshake check; only current values pass.
    pub fn node_for_key(&self, key: &PublicKey) -> Option<NodeId> {
        self.entries
            .lock()
            .expect("trust registry poisoned")
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(n, _)| n.clone())
    }

    /// Remove `node` from the whitelist. Returns true when an entry was
    /// actually removed. Irreversible within a run.
    pub fn revoke(&self, node: &NodeId) -> bool {
        self.entries
            .lock()
            .expect("trust registry poisoned")
            .remove(node)
            .is_some()
    }

    /// True when `node` is currently whitelisted.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.entries.lock().expect("trust registry poisoned").contains_key(node)
    }

    /// Snapshot of all current entries.
    pub fn snapshot(&self) -> BTreeMap<NodeId, PublicKey> {
        self.entries.lock().expect("trust registry poisoned").clone()
    }
}
