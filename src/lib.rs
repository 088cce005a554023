//! # tacmesh — the tactical mesh
//!
//! A peer-to-peer mesh of long-lived nodes, each holding a local replica of
//! a shared knowledge base and exchanging authenticated updates over an
//! encrypted transport until every reachable node converges to the same
//! state.
//!
//! Facts are `(subject, predicate, object)` triples tagged with a vector
//! clock naming the causal context they were produced in. Concurrent
//! writes are resolved deterministically (larger object byte string wins),
//! so all replicas agree on a single winner no matter the arrival order.
//!
//! ## Quick start
//!
//! ```ignore
//! use tacmesh::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = MeshConfig::new("Alpha");
//!     config.peers = tacmesh::config::parse_peers("Bravo:10.0.0.2", config.base_port)?;
//!
//!     let node = GossipEngine::start(config).await?;
//!
//!     // Replicated lazily by anti-entropy pull:
//!     node.write("unit:1", "status", "moving")?;
//!
//!     // Flooded mesh-wide on the FLASH lane:
//!     node.write_priority("unit:1", "orders", "FIRE_MISSION")?;
//!
//!     node.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! In dependency order:
//!
//! 1. [`clock`] — vector clocks, pure value operations
//! 2. [`store`] — durable triple store with a replay log
//! 3. [`trust`] — the identity whitelist, mutated only by revocation
//! 4. [`auth`] — the handshake authorizer worker
//! 5. [`transport`] — three prioritized encrypted lanes (FLASH, ROUTINE,
//!    BULK) plus per-peer outbound links
//! 6. [`engine`] — triage receive loop, anti-entropy pull, revocation
//!
//! ## Delivery model
//!
//! Nothing here is consensus. Lanes drop frames under backpressure (FLASH
//! drops are logged as critical), flooding is deduplicated rather than
//! acknowledged, and durability of replication is provided by the
//! cursor-driven log replay, which re-requests anything a drop lost.

pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod provision;
pub mod store;
pub mod transport;
pub mod trust;
pub mod types;
pub mod wire;

/// The commonly used surface of the crate.
pub mod prelude {
    pub use crate::clock::{Causality, VectorClock};
    pub use crate::config::{MeshConfig, PeerConfig};
    pub use crate::engine::GossipEngine;
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::store::{TripleStore, WriteOutcome};
    pub use crate::transport::Lane;
    pub use crate::types::{NodeId, Triple};
}

pub use crate::engine::GossipEngine;
pub use crate::error::{MeshError, MeshResult};
