//! The gossip engine: the coordinator that ties the store, the trust
//! registry, the authorizer, and the lane transport together.
//!
//! The engine runs three workers:
//!
//! - **receive-triage** — polls the three inbound lanes with a bounded
//!   multi-wait and drains them in strict priority order. FLASH is drained
//!   to exhaustion first; if it produced anything, the wait restarts
//!   without touching ROUTINE or BULK. Under sustained FLASH load BULK is
//!   completely starved, which is intentional.
//! - **anti-entropy** — periodically asks shuffled peers to replay their
//!   log past our cursor (`SYNC` out on ROUTINE, `ACK` back on the same
//!   connection). Unresponsive peers enter exponential backoff.
//! - **auth** — the handshake authorizer (see [`crate::auth`]).
//!
//! Inbound messages are deduplicated by a bounded FIFO of fingerprints so
//! FLASH flooding terminates: a `triple` or `REVOKE` heard on FLASH is
//! re-flooded raw to every peer exactly once, and the second copy of any
//! envelope is dropped on the floor.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth::AuthHandler;
use crate::clock::VectorClock;
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::store::{TripleStore, WriteOutcome};
use crate::transport::{InboundFrame, Lane, LaneReceivers, LaneTransport, TransportSnapshot};
use crate::trust::{NodeIdentity, TrustRegistry};
use crate::types::NodeId;
use crate::wire::{DedupCache, Envelope, Payload, TripleMsg, DEDUP_CAPACITY};

/// Upper bound of the triage multi-wait.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Log entries returned per anti-entropy reply.
const SYNC_BATCH: usize = 1000;

/// Bounded join deadline per worker during shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Deterministic part of the anti-entropy backoff:
/// `min(2 s, 0.1 s · 2^(failures − 1))`.
pub fn backoff_base(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let seconds = 0.1 * f64::from(1u32 << exp);
    Duration::from_secs_f64(seconds.min(2.0))
}

/// Backoff delay with jitter in `[0.9, 1.1]` applied.
pub fn backoff_delay(failures: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.9..=1.1);
    backoff_base(failures).mul_f64(jitter)
}

/// Per-peer anti-entropy failure tracking.
struct PeerHealth {
    failures: HashMap<NodeId, u32>,
    cooldown: HashMap<NodeId, Instant>,
}

impl PeerHealth {
    fn new() -> Self {
        Self {
            failures: HashMap::new(),
            cooldown: HashMap::new(),
        }
    }

    /// True while the peer's cooldown has not elapsed. An elapsed
    /// cooldown is cleared so the next tick retries.
    fn in_backoff(&mut self, peer: &NodeId) -> bool {
        match self.cooldown.get(peer) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.cooldown.remove(peer);
                false
            }
            None => false,
        }
    }

    fn record_failure(&mut self, peer: &NodeId) -> Duration {
        let failures = self.failures.entry(peer.clone()).or_insert(0);
        *failures += 1;
        let delay = backoff_delay(*failures);
        self.cooldown.insert(peer.clone(), Instant::now() + delay);
        delay
    }

    fn clear(&mut self, peer: &NodeId) {
        self.failures.remove(peer);
        self.cooldown.remove(peer);
    }
}

/// A mesh node's coordinator. Owns the store, the trust registry, the
/// authorizer, and the transport; cheap to share behind an `Arc`.
pub struct GossipEngine {
    config: MeshConfig,
    node: NodeId,
    store: Arc<TripleStore>,
    registry: Arc<TrustRegistry>,
    transport: Arc<LaneTransport>,
    dedup: Mutex<DedupCache>,
    cursors: Mutex<BTreeMap<NodeId, u64>>,
    health: Mutex<PeerHealth>,
    envelope_counter: AtomicU64,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipEngine {
    /// Boot a node: load identity and trust material, open the store, bind
    /// the lanes, connect configured peers, and spawn the workers.
    ///
    /// Everything that can fail here is a fatal boot error.
    pub async fn start(config: MeshConfig) -> MeshResult<Arc<Self>> {
        let identity = NodeIdentity::load(&config.keys_path)?;
        if identity.node_id != config.node_id {
            return Err(MeshError::Boot(format!(
                "identity file names {} but this node is {}",
                identity.node_id, config.node_id
            )));
        }

        let registry = Arc::new(TrustRegistry::load(&config.trust_file)?);
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(TripleStore::open(
            config.store_path(),
            config.node_id.clone(),
        )?);

        let (shutdown_tx, _) = broadcast::channel(8);
        let (auth, auth_worker) = AuthHandler::spawn(Arc::clone(&registry), shutdown_tx.subscribe());
        let (transport, receivers) = LaneTransport::bind(
            &identity,
            Arc::clone(&registry),
            auth,
            &config.bind_host,
            config.base_port,
            config.hwm,
            shutdown_tx.clone(),
        )
        .await?;

        let cursors = load_cursors(&config.cursor_path());

        let engine = Arc::new(Self {
            node: config.node_id.clone(),
            store,
            registry,
            transport,
            dedup: Mutex::new(DedupCache::new(DEDUP_CAPACITY)),
            cursors: Mutex::new(cursors),
            health: Mutex::new(PeerHealth::new()),
            envelope_counter: AtomicU64::new(0),
            running: AtomicBool::new(true),
            shutdown_tx: shutdown_tx.clone(),
            workers: Mutex::new(Vec::new()),
            config,
        });

        for peer in engine.config.peers.clone() {
            engine.connect_peer(&peer.id, &peer.host, peer.base_port);
        }

        let triage = tokio::spawn(run_triage(
            Arc::clone(&engine),
            receivers,
            shutdown_tx.subscribe(),
        ));
        let anti_entropy = tokio::spawn(run_anti_entropy(
            Arc::clone(&engine),
            shutdown_tx.subscribe(),
        ));
        engine
            .workers
            .lock()
            .expect("worker list poisoned")
            .extend([auth_worker, triage, anti_entropy]);

        tracing::info!(node = %engine.node, base_port = engine.base_port(), "node online");
        Ok(engine)
    }

    /// Stop the workers, close the transport, and flush the store.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("worker list poisoned")
            .drain(..)
            .collect();
        for mut worker in workers {
            if tokio::time::timeout(JOIN_TIMEOUT, &mut worker).await.is_err() {
                worker.abort();
            }
        }

        self.transport.close();
        if let Err(e) = self.store.close() {
            tracing::warn!(error = %e, "store flush failed during shutdown");
        }
        tracing::info!(node = %self.node, "node offline");
    }

    /// True until `stop` is called or a fatal storage fault fires.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// The lane base port actually bound.
    pub fn base_port(&self) -> u16 {
        self.transport.base_port()
    }

    /// The underlying triple store.
    pub fn store(&self) -> &TripleStore {
        &self.store
    }

    /// The trust registry.
    pub fn registry(&self) -> &TrustRegistry {
        &self.registry
    }

    /// Snapshot of the store's own vector clock.
    pub fn own_clock(&self) -> VectorClock {
        self.store.own_clock()
    }

    /// Current per-lane transport counters.
    pub fn stats(&self) -> TransportSnapshot {
        self.transport.stats()
    }

    /// The anti-entropy cursor recorded for `peer`.
    pub fn cursor_for(&self, peer: &NodeId) -> u64 {
        self.cursors
            .lock()
            .expect("cursor map poisoned")
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    /// Open outbound links to a trusted peer. Untrusted ids are ignored;
    /// static config and any runtime discovery both funnel through here.
    pub fn connect_peer(&self, id: &NodeId, host: &str, base_port: u16) {
        if id == &self.node {
            return;
        }
        if !self.registry.contains(id) {
            tracing::debug!(peer = %id, "not connecting untrusted peer");
            return;
        }
        self.transport.connect_peer(id.clone(), host.to_string(), base_port);
    }

    /// Commit a local write. Replication happens via anti-entropy pull.
    pub fn write(&self, subject: &str, predicate: &str, object: &str) -> MeshResult<WriteOutcome> {
        self.store.write_local(subject, predicate, object)
    }

    /// Commit a local write and flood it to every peer on FLASH.
    pub fn write_priority(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
    ) -> MeshResult<WriteOutcome> {
        let outcome = self.store.write_local(subject, predicate, object)?;
        if outcome.is_accepted() {
            if let Some(triple) = self.store.get_triple(subject, predicate)? {
                let envelope = self.envelope(Payload::Triple(TripleMsg {
                    s: triple.subject,
                    p: triple.predicate,
                    o: triple.object,
                    vc: triple.clock,
                }));
                self.flood_raw(Lane::Flash, &envelope.encode()?);
            }
        }
        Ok(outcome)
    }

    /// Send one payload to one peer on the given lane. Non-blocking; the
    /// frame is dropped under backpressure.
    pub fn send_to(&self, peer: &NodeId, lane: Lane, payload: Payload) -> MeshResult<()> {
        let envelope = self.envelope(payload);
        self.transport.send(peer, lane, envelope.encode()?);
        Ok(())
    }

    /// Remove an identity from the local whitelist, sever its links, and
    /// forget its sync state. Irreversible within a run; state previously
    /// accepted from the peer is not rolled back.
    pub fn revoke_peer(&self, target: &NodeId) {
        if target == &self.node {
            tracing::warn!("ignoring revocation naming this node");
            return;
        }

        let removed = self.registry.revoke(target);
        self.transport.disconnect_peer(target);
        let snapshot = {
            let mut cursors = self.cursors.lock().expect("cursor map poisoned");
            cursors.remove(target);
            cursors.clone()
        };
        self.health.lock().expect("peer health poisoned").clear(target);
        if let Err(e) = self.persist_cursors(&snapshot) {
            tracing::debug!(error = %e, "cursor file update failed after revocation");
        }

        if removed {
            tracing::warn!(%target, "identity revoked");
        } else {
            tracing::debug!(%target, "revocation for an identity not in the whitelist");
        }
    }

    /// Order the whole mesh to drop an identity: flood `REVOKE` on FLASH
    /// to every current peer, then apply it locally. Recipients apply the
    /// same two steps and re-flood once; dedup stops the echo.
    pub fn broadcast_revocation(&self, target: &NodeId) -> MeshResult<()> {
        tracing::warn!(%target, "broadcasting revocation");
        let envelope = self.envelope(Payload::Revoke {
            target: target.clone(),
        });
        self.flood_raw(Lane::Flash, &envelope.encode()?);
        self.revoke_peer(target);
        Ok(())
    }

    fn envelope(&self, payload: Payload) -> Envelope {
        Envelope::new(
            payload,
            self.node.clone(),
            self.envelope_counter.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn flood_raw(&self, lane: Lane, raw: &[u8]) {
        for peer in self.transport.peer_ids() {
            self.transport.send(&peer, lane, raw.to_vec());
        }
    }

    /// One inbound frame through decode, dedup, and dispatch.
    fn handle_frame(&self, frame: InboundFrame) {
        let envelope = match Envelope::decode(&frame.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::trace!(peer = %frame.peer, error = %e, "dropping undecodable frame");
                return;
            }
        };

        // Our own floods come back via multi-hop paths.
        if envelope.s == self.node {
            return;
        }
        // Messages originating at a revoked identity are refused even when
        // a still-trusted peer relays them.
        if !self.registry.contains(&envelope.s) {
            tracing::trace!(origin = %envelope.s, "dropping frame from untrusted origin");
            return;
        }
        {
            let mut dedup = self.dedup.lock().expect("dedup cache poisoned");
            if !dedup.observe(envelope.fingerprint()) {
                return;
            }
        }

        match envelope.payload {
            Payload::Triple(ref msg) => {
                match self.store.write_remote(&msg.s, &msg.p, &msg.o, &msg.vc, &envelope.s) {
                    Ok(outcome) => {
                        tracing::trace!(
                            subject = %msg.s,
                            predicate = %msg.p,
                            accepted = outcome.is_accepted(),
                            "remote triple"
                        );
                    }
                    Err(e @ MeshError::Corruption { .. }) => {
                        self.fail(e);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "remote triple write failed");
                        return;
                    }
                }
                // Priority facts must cross multi-hop paths fast. ROUTINE
                // and BULK data is already covered by anti-entropy pull,
                // so flooding those would be pure duplication.
                if frame.lane == Lane::Flash {
                    self.flood_raw(Lane::Flash, &frame.body);
                }
            }
            Payload::Revoke { ref target } => {
                if target == &self.node {
                    tracing::warn!(sender = %envelope.s, "ignoring revocation naming this node");
                    return;
                }
                self.revoke_peer(target);
                self.flood_raw(Lane::Flash, &frame.body);
            }
            Payload::Sync { seq } => match self.store.get_logs_since(seq, SYNC_BATCH) {
                Ok((entries, head)) => {
                    let ack = self.envelope(Payload::Ack {
                        u: entries.iter().map(TripleMsg::from).collect(),
                        h: head,
                    });
                    match ack.encode() {
                        Ok(bytes) => {
                            // Reply on the connection the request came in
                            // on, i.e. the same lane.
                            let _ = frame.reply.try_send(bytes);
                        }
                        Err(e) => tracing::warn!(error = %e, "could not encode sync reply"),
                    }
                }
                Err(e @ MeshError::Corruption { .. }) => self.fail(e),
                Err(e) => tracing::warn!(error = %e, "log replay failed"),
            },
            Payload::Ack { ref u, h } => {
                if let Err(e) = self.apply_ack(&envelope.s, u, h) {
                    match e {
                        MeshError::Corruption { .. } => self.fail(e),
                        e => tracing::warn!(error = %e, "could not apply sync reply"),
                    }
                }
            }
        }
    }

    /// Apply a batch of replayed log entries from `peer` and durably
    /// advance its cursor. An empty batch still advances the cursor.
    fn apply_ack(&self, peer: &NodeId, entries: &[TripleMsg], head: u64) -> MeshResult<()> {
        for entry in entries {
            self.store
                .write_remote(&entry.s, &entry.p, &entry.o, &entry.vc, peer)?;
        }
        let snapshot = {
            let mut cursors = self.cursors.lock().expect("cursor map poisoned");
            cursors.insert(peer.clone(), head);
            cursors.clone()
        };
        self.persist_cursors(&snapshot)?;
        if !entries.is_empty() {
            tracing::debug!(%peer, count = entries.len(), cursor = head, "synced");
        }
        Ok(())
    }

    fn persist_cursors(&self, snapshot: &BTreeMap<NodeId, u64>) -> MeshResult<()> {
        let path = self.config.cursor_path();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bincode::serialize(snapshot)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Fatal fault: log, mark stopped, and wake every worker so the node
    /// winds down. Only storage corruption takes this path.
    fn fail(&self, error: MeshError) {
        tracing::error!(error = %error, "fatal storage fault, stopping engine");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

fn load_cursors(path: &std::path::Path) -> BTreeMap<NodeId, u64> {
    match std::fs::read(path) {
        Ok(raw) => match bincode::deserialize(&raw) {
            Ok(cursors) => cursors,
            Err(e) => {
                // Safe to start over: the cost is a full log re-replay.
                tracing::warn!(error = %e, "cursor file unreadable, re-replaying from zero");
                BTreeMap::new()
            }
        },
        Err(_) => BTreeMap::new(),
    }
}

/// The receive-triage worker.
///
/// A single bounded multi-wait covers all three lanes; after every wake
/// FLASH is drained to exhaustion before ROUTINE is considered, and
/// ROUTINE before BULK. The `biased` select keeps the priority check
/// deterministic.
async fn run_triage(
    engine: Arc<GossipEngine>,
    mut lanes: LaneReceivers,
    mut shutdown: broadcast::Receiver<()>,
) {
    enum Woke {
        Frame(InboundFrame),
        Timeout,
        Stop,
    }

    loop {
        if !engine.is_running() {
            break;
        }

        let woke = tokio::select! {
            biased;
            _ = shutdown.recv() => Woke::Stop,
            frame = lanes.flash.recv() => frame.map(Woke::Frame).unwrap_or(Woke::Stop),
            frame = lanes.routine.recv() => frame.map(Woke::Frame).unwrap_or(Woke::Stop),
            frame = lanes.bulk.recv() => frame.map(Woke::Frame).unwrap_or(Woke::Stop),
            _ = tokio::time::sleep(POLL_INTERVAL) => Woke::Timeout,
        };

        let frame = match woke {
            Woke::Stop => break,
            Woke::Timeout => continue,
            Woke::Frame(frame) => frame,
        };

        let lane = frame.lane;
        engine.handle_frame(frame);
        match lane {
            // Any FLASH work restarts the wait so fresh FLASH traffic is
            // never queued behind the lower lanes.
            Lane::Flash => drain_lane(&engine, &mut lanes.flash),
            // FLASH was empty at the wake that produced this frame.
            Lane::Routine => drain_lane(&engine, &mut lanes.routine),
            Lane::Bulk => drain_lane(&engine, &mut lanes.bulk),
        }
    }
}

/// Drain one lane queue without blocking.
fn drain_lane(engine: &GossipEngine, lane: &mut tokio::sync::mpsc::Receiver<InboundFrame>) {
    while let Ok(frame) = lane.try_recv() {
        engine.handle_frame(frame);
    }
}

/// The anti-entropy worker: shuffle the peers each tick and pull the log
/// suffix past our cursor from each one that is not cooling down.
async fn run_anti_entropy(engine: Arc<GossipEngine>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(engine.config.gossip_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }

        let mut peers = engine.transport.peer_ids();
        peers.shuffle(&mut rand::thread_rng());

        for peer in peers {
            if !engine.is_running() {
                return;
            }
            if engine.health.lock().expect("peer health poisoned").in_backoff(&peer) {
                continue;
            }

            let cursor = engine.cursor_for(&peer);
            let request = engine.envelope(Payload::Sync { seq: cursor });
            let Ok(bytes) = request.encode() else { continue };

            match engine
                .transport
                .sync_request(&peer, bytes, engine.config.recv_timeout)
                .await
            {
                Ok(reply) => {
                    match Envelope::decode(&reply) {
                        Ok(envelope) => {
                            if let Payload::Ack { u, h } = envelope.payload {
                                match engine.apply_ack(&peer, &u, h) {
                                    Ok(()) => {
                                        engine
                                            .health
                                            .lock()
                                            .expect("peer health poisoned")
                                            .clear(&peer);
                                    }
                                    Err(e @ MeshError::Corruption { .. }) => {
                                        engine.fail(e);
                                        return;
                                    }
                                    Err(e) => {
                                        tracing::warn!(%peer, error = %e, "could not apply sync reply")
                                    }
                                }
                            }
                        }
                        Err(e) => tracing::trace!(%peer, error = %e, "undecodable sync reply"),
                    }
                }
                Err(_) => {
                    let delay = engine
                        .health
                        .lock()
                        .expect("peer health poisoned")
                        .record_failure(&peer);
                    tracing::debug!(%peer, delay_ms = delay.as_millis() as u64, "peer unresponsive, backing off");
                }
            }
        }
    }
}
