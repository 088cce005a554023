//! Mission key provisioning.
//!
//! Acts as the certificate authority for a deployment: generates an ed25519
//! identity per node, writes each private identity file under
//! `<key_dir>/private/`, and writes the aggregate trust file that every
//! node loads at boot.
//!
//! Layout:
//!
//! ```text
//! <key_dir>/
//! ├── private/
//! │   ├── Alpha.secret        {node_id, public, private}
//! │   └── Bravo.secret
//! └── mission_trust.json      {"Alpha": "<pubkey>", "Bravo": "<pubkey>"}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::error::MeshResult;
use crate::trust::{NodeIdentity, PublicKey};
use crate::types::NodeId;

/// Name of the aggregate trust file.
pub const TRUST_FILE_NAME: &str = "mission_trust.json";

/// Directory holding the per-node identity files.
pub const PRIVATE_DIR_NAME: &str = "private";

/// Generate fresh identities for `nodes` under `key_dir`.
///
/// Existing files are overwritten. Returns the trust map that was written,
/// which is convenient for tests and for tooling that provisions and boots
/// in one step.
pub fn generate_mission_keys(
    nodes: &[NodeId],
    key_dir: impl AsRef<Path>,
) -> MeshResult<BTreeMap<NodeId, PublicKey>> {
    let key_dir = key_dir.as_ref();
    let private_dir = key_dir.join(PRIVATE_DIR_NAME);
    std::fs::create_dir_all(&private_dir)?;

    let mut trust = BTreeMap::new();

    for node in nodes {
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = NodeIdentity::from_signing_key(node.clone(), &signing_key);
        identity.save(private_dir.join(format!("{node}.secret")))?;
        trust.insert(node.clone(), identity.public);
    }

    std::fs::write(
        key_dir.join(TRUST_FILE_NAME),
        serde_json::to_vec_pretty(&trust)?,
    )?;

    Ok(trust)
}

/// Path of the identity file provisioned for `node` under `key_dir`.
pub fn identity_path(key_dir: impl AsRef<Path>, node: &NodeId) -> std::path::PathBuf {
    key_dir
        .as_ref()
        .join(PRIVATE_DIR_NAME)
        .join(format!("{node}.secret"))
}

/// Path of the trust file under `key_dir`.
pub fn trust_path(key_dir: impl AsRef<Path>) -> std::path::PathBuf {
    key_dir.as_ref().join(TRUST_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{NodeIdentity, TrustRegistry};
    use tempfile::TempDir;

    #[test]
    fn provisioned_identities_match_the_trust_file() {
        let dir = TempDir::new().unwrap();
        let nodes: Vec<NodeId> = ["Alpha", "Bravo", "Charlie"]
            .iter()
            .map(|n| NodeId::new(*n))
            .collect();

        let trust = generate_mission_keys(&nodes, dir.path()).unwrap();
        assert_eq!(trust.len(), 3);

        let registry = TrustRegistry::load(trust_path(dir.path())).unwrap();
        for node in &nodes {
            let identity = NodeIdentity::load(identity_path(dir.path(), node)).unwrap();
            assert_eq!(&identity.node_id, node);
            assert_eq!(registry.key_for(node), Some(identity.public.clone()));
            // The private key must actually correspond to the public one.
            let signing = identity.signing_key().unwrap();
            assert_eq!(
                PublicKey::from_verifying_key(&signing.verifying_key()),
                identity.public
            );
        }
    }
}
