//! The handshake authorizer.
//!
//! Every inbound handshake is gated here: a connection is allowed iff the
//! advertised client key is currently present as a value of the trust
//! registry, and a successful check yields the node id registered for that
//! key. The authorizer runs as its own worker task answering queries over a
//! channel, so the transport holds no reference to the registry and
//! revocation takes effect on the very next handshake.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{MeshError, MeshResult};
use crate::trust::{PublicKey, TrustRegistry};
use crate::types::NodeId;

struct AuthRequest {
    key: PublicKey,
    reply: oneshot::Sender<Option<NodeId>>,
}

/// Cloneable handle for submitting authorization queries.
#[derive(Clone)]
pub struct AuthQuery {
    tx: mpsc::Sender<AuthRequest>,
}

impl AuthQuery {
    /// Ask whether `key` is currently trusted. `Ok(Some(node))` names the
    /// identity the key is registered under; `Ok(None)` means the handshake
    /// must be refused.
    pub async fn authorize(&self, key: &PublicKey) -> MeshResult<Option<NodeId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AuthRequest {
                key: key.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| MeshError::TransportClosed)?;
        reply_rx.await.map_err(|_| MeshError::TransportClosed)
    }
}

/// The authorizer worker.
pub struct AuthHandler;

impl AuthHandler {
    /// Spawn the worker. It answers queries until the shutdown channel
    /// fires or every query handle is dropped.
    pub fn spawn(
        registry: Arc<TrustRegistry>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> (AuthQuery, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuthRequest>(64);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = rx.recv() => {
                        match request {
                            Some(request) => {
                                let verdict = registry.node_for_key(&request.key);
                                // Receiver may have given up on the
                                // handshake already; that is fine.
                                let _ = request.reply.send(verdict);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });

        (AuthQuery { tx }, handle)
    }
}
