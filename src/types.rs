//! Common types used throughout tacmesh.
//!
//! These are the value types of the replicated store: node identities,
//! triples, store keys, and replication log entries. All of them are plain
//! data with value equality.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

/// Stable identifier for a node in the mesh.
///
/// Node ids are short operator-assigned names ("Alpha", "Unit_07"). They are
/// compared by value and serialized as bare strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single replicated fact.
///
/// The store keeps at most one triple per `(subject, predicate)` key. The
/// `clock` is the vector-clock snapshot captured when this revision was
/// produced and `writer` is the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    /// Subject, e.g. `"unit:7"`
    pub subject: String,
    /// Predicate, e.g. `"status"`
    pub predicate: String,
    /// Object value as text
    pub object: String,
    /// Causal context captured at commit time
    pub clock: VectorClock,
    /// The node that produced this revision
    pub writer: NodeId,
}

/// The store key for a triple: the deterministic encoding of
/// `(subject, predicate)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// The subject component
    pub subject: String,
    /// The predicate component
    pub predicate: String,
}

impl StoreKey {
    /// Create a key from its components.
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
        }
    }

    /// Encode the key into the byte form used by the storage backend.
    ///
    /// Format: `subject|predicate`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.subject.len() + 1 + self.predicate.len());
        out.extend_from_slice(self.subject.as_bytes());
        out.push(b'|');
        out.extend_from_slice(self.predicate.as_bytes());
        out
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.subject, self.predicate)
    }
}

/// An entry of the replication log: a triple plus the strictly monotone
/// local sequence number it was accepted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Local replication sequence number (dense, starts at 1)
    pub seq: u64,
    /// The accepted triple
    pub triple: Triple,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key_encoding_is_stable() {
        let key = StoreKey::new("unit:1", "status");
        assert_eq!(key.encode(), b"unit:1|status".to_vec());
    }

    #[test]
    fn store_key_equality() {
        let a = StoreKey::new("unit:1", "status");
        let b = StoreKey::new("unit:1", "status");
        let c = StoreKey::new("unit:1", "fuel");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn node_id_serializes_as_bare_string() {
        let id = NodeId::new("Alpha");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"Alpha\"");
    }
}
