//! Node configuration.
//!
//! All process-wide state is carried in an explicit [`MeshConfig`] value
//! handed to the engine constructor. `from_env` recognizes the deployment
//! variables the fleet tooling already sets; programmatic construction is
//! the path tests take.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};
use crate::types::NodeId;

/// Default lane base port.
pub const DEFAULT_BASE_PORT: u16 = 9000;

/// Default anti-entropy tick.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(500);

/// Default per-queue high-water mark.
pub const DEFAULT_HWM: usize = 1000;

/// Default anti-entropy reply timeout.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// Address of one configured peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's node id
    pub id: NodeId,
    /// Host name or address
    pub host: String,
    /// The peer's lane base port
    pub base_port: u16,
}

/// Configuration for one mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// This node's id (required)
    pub node_id: NodeId,
    /// Address the lanes bind on
    pub bind_host: String,
    /// Lane base port; zero picks a free contiguous triple
    pub base_port: u16,
    /// Statically configured peers
    pub peers: Vec<PeerConfig>,
    /// Anti-entropy tick interval
    pub gossip_interval: Duration,
    /// High-water mark for every lane queue
    pub hwm: usize,
    /// Anti-entropy reply timeout
    pub recv_timeout: Duration,
    /// Location of the trust file
    pub trust_file: PathBuf,
    /// Location of this node's identity file
    pub keys_path: PathBuf,
    /// Directory for the store and the peer cursor file
    pub data_dir: PathBuf,
}

impl MeshConfig {
    /// Configuration with defaults for everything but the node id.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        Self {
            bind_host: "0.0.0.0".to_string(),
            base_port: DEFAULT_BASE_PORT,
            peers: Vec::new(),
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            hwm: DEFAULT_HWM,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            trust_file: PathBuf::from("./keys/mission_trust.json"),
            keys_path: PathBuf::from(format!("./keys/private/{node_id}.secret")),
            data_dir: PathBuf::from("./data"),
            node_id,
        }
    }

    /// Read configuration from the environment.
    ///
    /// Recognized variables: `NODE_ID` (required), `BASE_PORT`, `PEERS`
    /// (comma list of `id:host[:port]`, missing port meaning `BASE_PORT`),
    /// `GOSSIP_INTERVAL` (seconds), `ZMQ_HWM`, `ZMQ_RCV_TIMEOUT`
    /// (milliseconds), `TRUST_FILE_PATH`, `KEYS_PATH`. The HWM and timeout
    /// names are kept for compatibility with existing fleet deployments.
    pub fn from_env() -> MeshResult<Self> {
        let node_id = std::env::var("NODE_ID")
            .map_err(|_| MeshError::Boot("NODE_ID environment variable not set".to_string()))?;
        let mut config = Self::new(node_id);

        if let Ok(raw) = std::env::var("BASE_PORT") {
            config.base_port = raw
                .parse()
                .map_err(|_| MeshError::Boot(format!("invalid BASE_PORT '{raw}'")))?;
        }
        if let Ok(raw) = std::env::var("GOSSIP_INTERVAL") {
            let seconds: f64 = raw
                .parse()
                .map_err(|_| MeshError::Boot(format!("invalid GOSSIP_INTERVAL '{raw}'")))?;
            config.gossip_interval = Duration::from_secs_f64(seconds);
        }
        if let Ok(raw) = std::env::var("ZMQ_HWM") {
            config.hwm = raw
                .parse()
                .map_err(|_| MeshError::Boot(format!("invalid ZMQ_HWM '{raw}'")))?;
        }
        if let Ok(raw) = std::env::var("ZMQ_RCV_TIMEOUT") {
            let millis: u64 = raw
                .parse()
                .map_err(|_| MeshError::Boot(format!("invalid ZMQ_RCV_TIMEOUT '{raw}'")))?;
            config.recv_timeout = Duration::from_millis(millis);
        }
        if let Ok(raw) = std::env::var("TRUST_FILE_PATH") {
            config.trust_file = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("KEYS_PATH") {
            config.keys_path = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("PEERS") {
            config.peers = parse_peers(&raw, config.base_port)?;
        }

        Ok(config)
    }

    /// Path of this node's store directory.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_db", self.node_id))
    }

    /// Path of this node's peer cursor file.
    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_cursors.bin", self.node_id))
    }
}

/// Parse the `PEERS` list: comma-separated `id:host[:port]` entries.
pub fn parse_peers(raw: &str, default_port: u16) -> MeshResult<Vec<PeerConfig>> {
    let mut peers = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split(':').collect();
        match parts.as_slice() {
            [id, host] => peers.push(PeerConfig {
                id: NodeId::new(*id),
                host: host.to_string(),
                base_port: default_port,
            }),
            [id, host, port] => peers.push(PeerConfig {
                id: NodeId::new(*id),
                host: host.to_string(),
                base_port: port
                    .parse()
                    .map_err(|_| MeshError::Boot(format!("invalid peer port in '{entry}'")))?,
            }),
            _ => {
                return Err(MeshError::Boot(format!(
                    "invalid PEERS entry '{entry}', expected id:host[:port]"
                )))
            }
        }
    }
    Ok(peers)
}
