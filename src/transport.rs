//! The multi-lane secure transport.
//!
//! Every node binds three independent prioritized lanes (FLASH, ROUTINE,
//! BULK) at fixed offsets from a base port, and keeps three outbound links
//! per known peer. Lanes share nothing: each has its own listener, its own
//! inbound queue, and its own per-peer outbound queue, so a congested BULK
//! lane cannot interfere with FLASH delivery.
//!
//! # Secure channel
//!
//! Connections are mutually authenticated against the trust registry and
//! encrypted end to end:
//!
//! 1. The dialer sends a hello naming its node, its long-term ed25519
//!    identity key, a fresh x25519 ephemeral key, and a random nonce, all
//!    bound together by an identity signature.
//! 2. The listener asks the handshake authorizer whether that exact
//!    identity key is currently whitelisted; refusal closes the connection
//!    with nothing delivered.
//! 3. The listener answers with its own identity and ephemeral key, signing
//!    the dialer's nonce and both ephemeral keys; the dialer requires the
//!    answering identity to be the registry entry for the peer it dialed.
//! 4. Both sides derive directional ChaCha20-Poly1305 keys from the ECDH
//!    shared secret via HKDF-SHA256 and switch to AEAD-framed messages.
//!
//! # Backpressure
//!
//! `send` never blocks: each outbound link is a bounded queue sized by the
//! configured high-water mark, and a full queue drops the frame. FLASH
//! drops are logged as critical; ROUTINE and BULK drops are silent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::auth::AuthQuery;
use crate::error::{MeshError, MeshResult};
use crate::trust::{NodeIdentity, PublicKey, TrustRegistry};
use crate::types::NodeId;

/// Maximum encrypted frame size (16 MB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum plaintext hello size during the handshake.
const MAX_HELLO_SIZE: usize = 4096;

/// Dial timeout for outbound connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Attempts to find a free contiguous port triple when binding port 0.
const BIND_ATTEMPTS: usize = 16;

/// One of the three prioritized channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Priority orders; flooded mesh-wide, drops are critical
    Flash,
    /// Regular traffic and anti-entropy pulls
    Routine,
    /// Heavy low-priority payloads; first to starve under load
    Bulk,
}

impl Lane {
    /// All lanes in triage order.
    pub const ALL: [Lane; 3] = [Lane::Flash, Lane::Routine, Lane::Bulk];

    /// Fixed port offset from the base port.
    pub fn offset(&self) -> u16 {
        match self {
            Lane::Flash => 0,
            Lane::Routine => 1,
            Lane::Bulk => 2,
        }
    }

    /// The lane's port given a base port.
    pub fn port(&self, base: u16) -> u16 {
        base + self.offset()
    }

    fn index(&self) -> usize {
        self.offset() as usize
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Lane::Flash => "FLASH",
            Lane::Routine => "ROUTINE",
            Lane::Bulk => "BULK",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Secure channel
// ─────────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ClientHello {
    node: NodeId,
    identity_key: PublicKey,
    eph: String,
    nonce: String,
    sig: String,
}

#[derive(Serialize, Deserialize)]
struct ServerHello {
    node: NodeId,
    identity_key: PublicKey,
    eph: String,
    sig: String,
}

/// Decrypting read half of an established channel.
struct SecureReader {
    half: OwnedReadHalf,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

/// Encrypting write half of an established channel.
struct SecureWriter {
    half: OwnedWriteHalf,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

/// An authenticated encrypted connection.
pub(crate) struct SecureChannel {
    reader: SecureReader,
    writer: SecureWriter,
}

fn frame_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

impl SecureWriter {
    async fn send_frame(&mut self, plaintext: &[u8]) -> MeshResult<()> {
        let sealed = self
            .cipher
            .encrypt(&frame_nonce(self.counter), plaintext)
            .map_err(|_| MeshError::Crypto("frame seal failed".to_string()))?;
        self.counter += 1;

        if sealed.len() > MAX_FRAME_SIZE {
            return Err(MeshError::Crypto(format!(
                "frame too large: {} bytes",
                sealed.len()
            )));
        }
        self.half.write_all(&(sealed.len() as u32).to_be_bytes()).await?;
        self.half.write_all(&sealed).await?;
        self.half.flush().await?;
        Ok(())
    }
}

impl SecureReader {
    async fn recv_frame(&mut self) -> MeshResult<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.half.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(MeshError::Crypto(format!("frame too large: {len} bytes")));
        }

        let mut sealed = vec![0u8; len];
        self.half.read_exact(&mut sealed).await?;

        let plain = self
            .cipher
            .decrypt(&frame_nonce(self.counter), sealed.as_slice())
            .map_err(|_| MeshError::Crypto("frame failed authentication".to_string()))?;
        self.counter += 1;
        Ok(plain)
    }
}

impl SecureChannel {
    async fn send_frame(&mut self, plaintext: &[u8]) -> MeshResult<()> {
        self.writer.send_frame(plaintext).await
    }

    async fn recv_frame(&mut self) -> MeshResult<Vec<u8>> {
        self.reader.recv_frame().await
    }

    fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

async fn write_plain(stream: &mut TcpStream, bytes: &[u8]) -> MeshResult<()> {
    if bytes.len() > MAX_HELLO_SIZE {
        return Err(MeshError::Crypto("hello too large".to_string()));
    }
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_plain(stream: &mut TcpStream) -> MeshResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_HELLO_SIZE {
        return Err(MeshError::Crypto("hello too large".to_string()));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

fn decode_hex<const N: usize>(text: &str, what: &str) -> MeshResult<[u8; N]> {
    hex::decode(text)
        .map_err(|e| MeshError::Crypto(format!("bad {what}: {e}")))?
        .try_into()
        .map_err(|_| MeshError::Crypto(format!("bad {what}: wrong length")))
}

/// Derive the two directional AEAD keys from the handshake secrets.
fn derive_ciphers(
    shared: &x25519_dalek::SharedSecret,
    salt: &[u8; 32],
) -> MeshResult<(ChaCha20Poly1305, ChaCha20Poly1305)> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut c2s = [0u8; 32];
    let mut s2c = [0u8; 32];
    hk.expand(b"tacmesh c2s", &mut c2s)
        .map_err(|_| MeshError::Crypto("key derivation failed".to_string()))?;
    hk.expand(b"tacmesh s2c", &mut s2c)
        .map_err(|_| MeshError::Crypto("key derivation failed".to_string()))?;

    let c2s = ChaCha20Poly1305::new_from_slice(&c2s)
        .map_err(|_| MeshError::Crypto("bad derived key".to_string()))?;
    let s2c = ChaCha20Poly1305::new_from_slice(&s2c)
        .map_err(|_| MeshError::Crypto("bad derived key".to_string()))?;
    Ok((c2s, s2c))
}

/// Dial `addr` and run the client half of the handshake, expecting the
/// server to present `expected_key`.
async fn connect_secure(
    addr: SocketAddr,
    node: &NodeId,
    identity_key: &PublicKey,
    signing: &SigningKey,
    expected_key: &PublicKey,
) -> MeshResult<SecureChannel> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| MeshError::PeerTimeout(node.clone()))??;

    let eph_secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let eph_public = x25519_dalek::PublicKey::from(&eph_secret);
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);

    let mut transcript = Vec::with_capacity(64);
    transcript.extend_from_slice(eph_public.as_bytes());
    transcript.extend_from_slice(&nonce);
    let sig = signing.sign(&transcript);

    let hello = ClientHello {
        node: node.clone(),
        identity_key: identity_key.clone(),
        eph: hex::encode(eph_public.as_bytes()),
        nonce: hex::encode(nonce),
        sig: hex::encode(sig.to_bytes()),
    };
    write_plain(&mut stream, &serde_json::to_vec(&hello)?).await?;

    let answer: ServerHello = serde_json::from_slice(&read_plain(&mut stream).await?)?;
    if &answer.identity_key != expected_key {
        return Err(MeshError::Crypto(
            "server identity does not match the registry".to_string(),
        ));
    }

    let server_eph: [u8; 32] = decode_hex(&answer.eph, "server ephemeral")?;
    let server_sig: [u8; 64] = decode_hex(&answer.sig, "server signature")?;

    let mut expected_transcript = Vec::with_capacity(96);
    expected_transcript.extend_from_slice(&server_eph);
    expected_transcript.extend_from_slice(&nonce);
    expected_transcript.extend_from_slice(eph_public.as_bytes());
    answer
        .identity_key
        .verifying_key()?
        .verify(&expected_transcript, &Signature::from_bytes(&server_sig))
        .map_err(|_| MeshError::Crypto("server signature invalid".to_string()))?;

    let shared = eph_secret.diffie_hellman(&x25519_dalek::PublicKey::from(server_eph));
    let (c2s, s2c) = derive_ciphers(&shared, &nonce)?;

    let (read_half, write_half) = stream.into_split();
    Ok(SecureChannel {
        reader: SecureReader {
            half: read_half,
            cipher: s2c,
            counter: 0,
        },
        writer: SecureWriter {
            half: write_half,
            cipher: c2s,
            counter: 0,
        },
    })
}

/// Run the server half of the handshake on an accepted connection.
/// Returns the authenticated peer identity alongside the channel.
async fn accept_secure(
    mut stream: TcpStream,
    node: &NodeId,
    identity_key: &PublicKey,
    signing: &SigningKey,
    auth: &AuthQuery,
) -> MeshResult<(NodeId, SecureChannel)> {
    let hello: ClientHello = serde_json::from_slice(&read_plain(&mut stream).await?)?;

    let client_eph: [u8; 32] = decode_hex(&hello.eph, "client ephemeral")?;
    let client_nonce: [u8; 32] = decode_hex(&hello.nonce, "client nonce")?;
    let client_sig: [u8; 64] = decode_hex(&hello.sig, "client signature")?;

    let mut transcript = Vec::with_capacity(64);
    transcript.extend_from_slice(&client_eph);
    transcript.extend_from_slice(&client_nonce);
    hello
        .identity_key
        .verifying_key()?
        .verify(&transcript, &Signature::from_bytes(&client_sig))
        .map_err(|_| MeshError::Crypto("client signature invalid".to_string()))?;

    // The whitelist check. Refusal is silent: drop the connection without
    // an answer and without logging key material.
    let peer = match auth.authorize(&hello.identity_key).await? {
        Some(peer) if peer == hello.node => peer,
        _ => return Err(MeshError::AuthDenied),
    };

    let eph_secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let eph_public = x25519_dalek::PublicKey::from(&eph_secret);

    let mut transcript = Vec::with_capacity(96);
    transcript.extend_from_slice(eph_public.as_bytes());
    transcript.extend_from_slice(&client_nonce);
    transcript.extend_from_slice(&client_eph);
    let sig = signing.sign(&transcript);

    let answer = ServerHello {
        node: node.clone(),
        identity_key: identity_key.clone(),
        eph: hex::encode(eph_public.as_bytes()),
        sig: hex::encode(sig.to_bytes()),
    };
    write_plain(&mut stream, &serde_json::to_vec(&answer)?).await?;

    let shared = eph_secret.diffie_hellman(&x25519_dalek::PublicKey::from(client_eph));
    let (c2s, s2c) = derive_ciphers(&shared, &client_nonce)?;

    let (read_half, write_half) = stream.into_split();
    Ok((
        peer,
        SecureChannel {
            reader: SecureReader {
                half: read_half,
                cipher: c2s,
                counter: 0,
            },
            writer: SecureWriter {
                half: write_half,
                cipher: s2c,
                counter: 0,
            },
        },
    ))
}

// ─────────────────────────────────────────────────────────────────────────
// Counters
// ─────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LaneCounters {
    tx_msgs: AtomicU64,
    tx_bytes: AtomicU64,
    rx_msgs: AtomicU64,
    rx_bytes: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time counters for one lane.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LaneSnapshot {
    /// Messages sent
    pub tx_msgs: u64,
    /// Bytes sent
    pub tx_bytes: u64,
    /// Messages received
    pub rx_msgs: u64,
    /// Bytes received
    pub rx_bytes: u64,
    /// Frames dropped under backpressure
    pub dropped: u64,
}

/// Point-in-time counters for all three lanes.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportSnapshot {
    /// FLASH lane counters
    pub flash: LaneSnapshot,
    /// ROUTINE lane counters
    pub routine: LaneSnapshot,
    /// BULK lane counters
    pub bulk: LaneSnapshot,
}

impl LaneCounters {
    fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot {
            tx_msgs: self.tx_msgs.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_msgs: self.rx_msgs.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────

/// A decrypted inbound message, tagged with the handshake-proven sender.
pub struct InboundFrame {
    /// The authenticated peer that sent this frame
    pub peer: NodeId,
    /// Lane the frame arrived on
    pub lane: Lane,
    /// Decrypted message body
    pub body: Vec<u8>,
    /// Writes a reply back on the connection the frame arrived on
    pub reply: mpsc::Sender<Vec<u8>>,
}

/// Receive ends of the three inbound lane queues, consumed by the engine's
/// triage loop.
pub struct LaneReceivers {
    /// FLASH inbound queue
    pub flash: mpsc::Receiver<InboundFrame>,
    /// ROUTINE inbound queue
    pub routine: mpsc::Receiver<InboundFrame>,
    /// BULK inbound queue
    pub bulk: mpsc::Receiver<InboundFrame>,
}

struct LaneLink {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

struct SyncLane {
    channel: Option<SecureChannel>,
}

struct PeerLink {
    host: String,
    base_port: u16,
    lanes: [LaneLink; 3],
    sync: Arc<tokio::sync::Mutex<SyncLane>>,
}

/// The three-lane secure transport of one node.
pub struct LaneTransport {
    node: NodeId,
    identity_key: PublicKey,
    signing: SigningKey,
    registry: Arc<TrustRegistry>,
    base_port: u16,
    hwm: usize,
    peers: Mutex<HashMap<NodeId, PeerLink>>,
    counters: [Arc<LaneCounters>; 3],
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LaneTransport {
    /// Bind the three lane listeners and start accepting handshakes.
    ///
    /// `base_port` zero asks for any free contiguous port triple, which is
    /// reported back via [`LaneTransport::base_port`]. A lane that cannot
    /// bind is a boot failure.
    pub async fn bind(
        identity: &NodeIdentity,
        registry: Arc<TrustRegistry>,
        auth: AuthQuery,
        bind_host: &str,
        base_port: u16,
        hwm: usize,
        shutdown_tx: broadcast::Sender<()>,
    ) -> MeshResult<(Arc<Self>, LaneReceivers)> {
        let signing = identity.signing_key()?;
        let (listeners, bound_base) = bind_lanes(bind_host, base_port).await?;

        let (flash_tx, flash_rx) = mpsc::channel(hwm);
        let (routine_tx, routine_rx) = mpsc::channel(hwm);
        let (bulk_tx, bulk_rx) = mpsc::channel(hwm);
        let inbound = [flash_tx, routine_tx, bulk_tx];

        let transport = Arc::new(Self {
            node: identity.node_id.clone(),
            identity_key: identity.public.clone(),
            signing,
            registry,
            base_port: bound_base,
            hwm,
            peers: Mutex::new(HashMap::new()),
            counters: [
                Arc::new(LaneCounters::default()),
                Arc::new(LaneCounters::default()),
                Arc::new(LaneCounters::default()),
            ],
            listener_tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        });

        for (lane, listener) in Lane::ALL.into_iter().zip(listeners) {
            let task = tokio::spawn(run_lane_listener(
                listener,
                lane,
                Arc::clone(&transport),
                auth.clone(),
                inbound[lane.index()].clone(),
                transport.shutdown_tx.subscribe(),
            ));
            transport.listener_tasks.lock().expect("listener tasks poisoned").push(task);
        }

        tracing::info!(
            node = %transport.node,
            base_port = bound_base,
            "lanes online"
        );

        Ok((
            transport,
            LaneReceivers {
                flash: flash_rx,
                routine: routine_rx,
                bulk: bulk_rx,
            },
        ))
    }

    /// The base port the lanes are actually bound to.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Open the three outbound lane links to a peer. Replaces any existing
    /// links for the same peer.
    pub fn connect_peer(&self, peer: NodeId, host: String, base_port: u16) {
        let lanes = Lane::ALL.map(|lane| {
            let (tx, rx) = mpsc::channel(self.hwm);
            let task = tokio::spawn(run_lane_writer(
                LinkTarget {
                    peer: peer.clone(),
                    lane,
                    host: host.clone(),
                    port: lane.port(base_port),
                    node: self.node.clone(),
                    identity_key: self.identity_key.clone(),
                    signing: self.signing.clone(),
                    registry: Arc::clone(&self.registry),
                },
                rx,
                Arc::clone(&self.counters[lane.index()]),
                self.shutdown_tx.subscribe(),
            ));
            LaneLink { tx, task }
        });

        let link = PeerLink {
            host,
            base_port,
            lanes,
            sync: Arc::new(tokio::sync::Mutex::new(SyncLane { channel: None })),
        };

        let previous = self
            .peers
            .lock()
            .expect("peer table poisoned")
            .insert(peer.clone(), link);
        if let Some(previous) = previous {
            for lane in previous.lanes {
                lane.task.abort();
            }
        }
        tracing::debug!(node = %self.node, %peer, "peer links open");
    }

    /// Close all three links to a peer and forget it.
    pub fn disconnect_peer(&self, peer: &NodeId) {
        let removed = self.peers.lock().expect("peer table poisoned").remove(peer);
        if let Some(link) = removed {
            for lane in link.lanes {
                lane.task.abort();
            }
            tracing::debug!(node = %self.node, %peer, "peer links severed");
        }
    }

    /// Nodes we currently hold outbound links to.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Non-blocking send. A full queue (or a missing peer) drops the
    /// frame; FLASH drops are critical.
    pub fn send(&self, peer: &NodeId, lane: Lane, bytes: Vec<u8>) {
        let tx = {
            let peers = self.peers.lock().expect("peer table poisoned");
            peers.get(peer).map(|p| p.lanes[lane.index()].tx.clone())
        };

        let Some(tx) = tx else {
            if lane == Lane::Flash {
                tracing::error!(node = %self.node, %peer, "FLASH drop: peer unknown");
            }
            return;
        };

        let len = bytes.len() as u64;
        match tx.try_send(bytes) {
            Ok(()) => {
                let counters = &self.counters[lane.index()];
                counters.tx_msgs.fetch_add(1, Ordering::Relaxed);
                counters.tx_bytes.fetch_add(len, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters[lane.index()].dropped.fetch_add(1, Ordering::Relaxed);
                if lane == Lane::Flash {
                    tracing::error!(node = %self.node, %peer, "FLASH drop: backpressure");
                }
            }
        }
    }

    /// Request-reply on the peer's ROUTINE lane, used by anti-entropy.
    ///
    /// Sends `bytes` and waits up to `reply_timeout` for one frame back on
    /// the same connection. Any failure tears the connection down and
    /// reports a peer timeout so the caller can enter backoff.
    pub async fn sync_request(
        &self,
        peer: &NodeId,
        bytes: Vec<u8>,
        reply_timeout: Duration,
    ) -> MeshResult<Vec<u8>> {
        let (sync, host, port) = {
            let peers = self.peers.lock().expect("peer table poisoned");
            let link = peers.get(peer).ok_or(MeshError::TransportClosed)?;
            (
                Arc::clone(&link.sync),
                link.host.clone(),
                Lane::Routine.port(link.base_port),
            )
        };

        let mut sync = sync.lock().await;

        if sync.channel.is_none() {
            let expected = self
                .registry
                .key_for(peer)
                .ok_or(MeshError::AuthDenied)?;
            let addr = resolve(&host, port).await?;
            let channel = connect_secure(
                addr,
                &self.node,
                &self.identity_key,
                &self.signing,
                &expected,
            )
            .await
            .map_err(|_| MeshError::PeerTimeout(peer.clone()))?;
            sync.channel = Some(channel);
        }

        let channel = sync.channel.as_mut().ok_or(MeshError::TransportClosed)?;
        let result = async {
            channel.send_frame(&bytes).await?;
            tokio::time::timeout(reply_timeout, channel.recv_frame())
                .await
                .map_err(|_| MeshError::PeerTimeout(peer.clone()))?
        }
        .await;

        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // Drop the connection; the next request redials.
                sync.channel = None;
                match e {
                    MeshError::PeerTimeout(_) => Err(e),
                    _ => Err(MeshError::PeerTimeout(peer.clone())),
                }
            }
        }
    }

    /// Current lane counters.
    pub fn stats(&self) -> TransportSnapshot {
        TransportSnapshot {
            flash: self.counters[Lane::Flash.index()].snapshot(),
            routine: self.counters[Lane::Routine.index()].snapshot(),
            bulk: self.counters[Lane::Bulk.index()].snapshot(),
        }
    }

    /// Tear down all links and listeners. Called by the engine after its
    /// workers have stopped; safe to call twice.
    pub fn close(&self) {
        let links: Vec<PeerLink> = {
            let mut peers = self.peers.lock().expect("peer table poisoned");
            peers.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            for lane in link.lanes {
                lane.task.abort();
            }
        }
        for task in self.listener_tasks.lock().expect("listener tasks poisoned").drain(..) {
            task.abort();
        }
    }
}

async fn resolve(host: &str, port: u16) -> MeshResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| MeshError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {host}:{port}"),
        )))
}

/// Bind the three lane listeners. With a zero base we probe random bases
/// until a contiguous triple is free.
async fn bind_lanes(host: &str, base_port: u16) -> MeshResult<(Vec<TcpListener>, u16)> {
    if base_port != 0 {
        let mut listeners = Vec::with_capacity(3);
        for lane in Lane::ALL {
            let listener = TcpListener::bind((host, lane.port(base_port)))
                .await
                .map_err(|e| {
                    MeshError::Boot(format!("cannot bind {lane} lane on port {}: {e}", lane.port(base_port)))
                })?;
            listeners.push(listener);
        }
        return Ok((listeners, base_port));
    }

    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let candidate = 20000 + (rand::random::<u16>() % 40000);
        let mut listeners = Vec::with_capacity(3);
        let mut ok = true;
        for lane in Lane::ALL {
            match TcpListener::bind((host, lane.port(candidate))).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    last_err = Some(e);
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            return Ok((listeners, candidate));
        }
    }
    Err(MeshError::Boot(format!(
        "cannot find a free lane port triple: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn run_lane_listener(
    listener: TcpListener,
    lane: Lane,
    transport: Arc<LaneTransport>,
    auth: AuthQuery,
    inbound: mpsc::Sender<InboundFrame>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, remote)) = accepted else { continue };
                tokio::spawn(serve_connection(
                    stream,
                    remote,
                    lane,
                    Arc::clone(&transport),
                    auth.clone(),
                    inbound.clone(),
                    transport.shutdown_tx.subscribe(),
                ));
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    lane: Lane,
    transport: Arc<LaneTransport>,
    auth: AuthQuery,
    inbound: mpsc::Sender<InboundFrame>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (peer, channel) = match accept_secure(
        stream,
        &transport.node,
        &transport.identity_key,
        &transport.signing,
        &auth,
    )
    .await
    {
        Ok(accepted) => accepted,
        Err(MeshError::AuthDenied) => {
            tracing::debug!(%lane, %remote, "handshake refused");
            return;
        }
        Err(e) => {
            tracing::debug!(%lane, %remote, error = %e, "handshake failed");
            return;
        }
    };

    let (mut reader, mut writer) = channel.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(64);

    let reply_task = tokio::spawn(async move {
        while let Some(bytes) = reply_rx.recv().await {
            if writer.send_frame(&bytes).await.is_err() {
                break;
            }
        }
    });

    let counters = Arc::clone(&transport.counters[lane.index()]);
    loop {
        tokio::select! {
            frame = reader.recv_frame() => {
                match frame {
                    Ok(body) => {
                        // Revocation severs established connections too,
                        // not just future handshakes.
                        if transport.registry.key_for(&peer).is_none() {
                            tracing::debug!(%peer, "closing connection of revoked identity");
                            break;
                        }
                        counters.rx_msgs.fetch_add(1, Ordering::Relaxed);
                        counters.rx_bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
                        let frame = InboundFrame {
                            peer: peer.clone(),
                            lane,
                            body,
                            reply: reply_tx.clone(),
                        };
                        if inbound.try_send(frame).is_err() {
                            counters.dropped.fetch_add(1, Ordering::Relaxed);
                            if lane == Lane::Flash {
                                tracing::error!(%peer, "FLASH drop: inbound queue full");
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    reply_task.abort();
}

struct LinkTarget {
    peer: NodeId,
    lane: Lane,
    host: String,
    port: u16,
    node: NodeId,
    identity_key: PublicKey,
    signing: SigningKey,
    registry: Arc<TrustRegistry>,
}

impl LinkTarget {
    async fn dial(&self) -> MeshResult<SecureChannel> {
        // The registry is consulted at dial time, so a revoked peer can
        // never be dialed again even if a link task is still alive.
        let expected = self
            .registry
            .key_for(&self.peer)
            .ok_or(MeshError::AuthDenied)?;
        let addr = resolve(&self.host, self.port).await?;
        connect_secure(addr, &self.node, &self.identity_key, &self.signing, &expected).await
    }
}

async fn run_lane_writer(
    target: LinkTarget,
    mut rx: mpsc::Receiver<Vec<u8>>,
    counters: Arc<LaneCounters>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut channel: Option<SecureChannel> = None;

    loop {
        let bytes = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(bytes) => bytes,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        if channel.is_none() {
            match target.dial().await {
                Ok(c) => channel = Some(c),
                Err(e) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    if target.lane == Lane::Flash {
                        tracing::error!(peer = %target.peer, error = %e, "FLASH drop: dial failed");
                    } else {
                        tracing::trace!(peer = %target.peer, lane = %target.lane, error = %e, "drop: dial failed");
                    }
                    continue;
                }
            }
        }

        if let Some(c) = channel.as_mut() {
            if let Err(e) = c.send_frame(&bytes).await {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                if target.lane == Lane::Flash {
                    tracing::error!(peer = %target.peer, error = %e, "FLASH drop: send failed");
                }
                channel = None;
            }
        }
    }
}
