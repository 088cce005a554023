//! Error types for tacmesh operations.
//!
//! All fallible operations in the crate return `Result<T, MeshError>`. The
//! variants are well-typed so callers can pattern-match on the failure mode;
//! only `Boot` and `Corruption` are treated as fatal by the engine.

use thiserror::Error;

use crate::types::NodeId;

/// The main error type for tacmesh operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Startup could not complete (missing identity keys, malformed trust
    /// file, a lane failed to bind). Aborts the node.
    #[error("boot failure: {0}")]
    Boot(String),

    /// An inbound handshake presented a key that is not in the trust
    /// registry. The connection is refused with no payload delivered.
    #[error("handshake refused by authorizer")]
    AuthDenied,

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A stored blob failed to decode. This indicates on-disk corruption
    /// and is surfaced to the operator rather than skipped.
    #[error("corrupt record at '{key}': {reason}")]
    Corruption {
        /// The store key whose value could not be decoded
        key: String,
        /// Decoder diagnostics
        reason: String,
    },

    /// A wire envelope or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A binary blob could not be encoded.
    #[error("binary codec error: {0}")]
    Bincode(#[from] bincode::Error),

    /// A peer did not answer an anti-entropy request within the reply
    /// timeout. Isolated to that peer; triggers backoff.
    #[error("peer {0} timed out")]
    PeerTimeout(NodeId),

    /// The transport was torn down while a call was in flight.
    #[error("transport terminated")]
    TransportClosed,

    /// A cryptographic operation failed (bad key text, bad signature,
    /// AEAD failure on a frame).
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tacmesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
