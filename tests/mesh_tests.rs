//! End-to-end mesh tests: several real nodes on loopback exercising
//! anti-entropy catch-up, FLASH flooding with dedup, lane triage, and the
//! revocation pathway.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tacmesh::auth::AuthHandler;
use tacmesh::clock::VectorClock;
use tacmesh::config::MeshConfig;
use tacmesh::engine::GossipEngine;
use tacmesh::provision;
use tacmesh::transport::{Lane, LaneTransport};
use tacmesh::trust::{NodeIdentity, TrustRegistry};
use tacmesh::types::NodeId;
use tacmesh::wire::{Envelope, Payload, TripleMsg};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Start a node on loopback with random lane ports.
async fn start_node(
    name: &str,
    key_dir: &Path,
    data_dir: &Path,
    gossip: Duration,
) -> Arc<GossipEngine> {
    let node = NodeId::new(name);
    let mut config = MeshConfig::new(name);
    config.bind_host = "127.0.0.1".to_string();
    config.base_port = 0;
    config.gossip_interval = gossip;
    config.recv_timeout = Duration::from_millis(500);
    config.trust_file = provision::trust_path(key_dir);
    config.keys_path = provision::identity_path(key_dir, &node);
    config.data_dir = data_dir.join(name);
    GossipEngine::start(config).await.unwrap()
}

/// Open links in both directions between two nodes.
fn link(a: &GossipEngine, b: &GossipEngine) {
    a.connect_peer(b.node_id(), "127.0.0.1", b.base_port());
    b.connect_peer(a.node_id(), "127.0.0.1", a.base_port());
}

/// Poll `cond` until it holds or the deadline passes.
async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// A bare transport posing as a provisioned node, for injecting raw
/// frames the way the fleet's injection tooling does.
async fn injector(
    name: &str,
    key_dir: &Path,
    hwm: usize,
    target: &GossipEngine,
) -> (Arc<LaneTransport>, broadcast::Sender<()>) {
    let identity =
        NodeIdentity::load(provision::identity_path(key_dir, &NodeId::new(name))).unwrap();
    let registry = Arc::new(TrustRegistry::load(provision::trust_path(key_dir)).unwrap());
    let (shutdown_tx, _) = broadcast::channel(4);
    let (auth, _worker) = AuthHandler::spawn(Arc::clone(&registry), shutdown_tx.subscribe());
    let (transport, _receivers) = LaneTransport::bind(
        &identity,
        registry,
        auth,
        "127.0.0.1",
        0,
        hwm,
        shutdown_tx.clone(),
    )
    .await
    .unwrap();
    transport.connect_peer(
        target.node_id().clone(),
        "127.0.0.1".to_string(),
        target.base_port(),
    );
    (transport, shutdown_tx)
}

fn triple_envelope(
    sender: &str,
    counter: u64,
    subject: &str,
    predicate: &str,
    object: &str,
    clock: &[(&str, u64)],
) -> Envelope {
    Envelope::new(
        Payload::Triple(TripleMsg {
            s: subject.to_string(),
            p: predicate.to_string(),
            o: object.to_string(),
            vc: clock
                .iter()
                .map(|(n, c)| (NodeId::new(*n), *c))
                .collect::<VectorClock>(),
        }),
        NodeId::new(sender),
        counter,
    )
}

#[tokio::test]
async fn anti_entropy_catches_a_peer_up_from_zero() {
    let keys = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let nodes: Vec<NodeId> = ["Alpha", "Bravo"].iter().map(|n| NodeId::new(*n)).collect();
    provision::generate_mission_keys(&nodes, keys.path()).unwrap();

    let alpha = start_node("Alpha", keys.path(), data.path(), Duration::from_millis(100)).await;
    let bravo = start_node("Bravo", keys.path(), data.path(), Duration::from_millis(100)).await;

    for i in 0..50 {
        alpha
            .write(&format!("unit:{i}"), "status", "ready")
            .unwrap();
    }

    // Bravo pulls the whole log through its cursor.
    bravo.connect_peer(alpha.node_id(), "127.0.0.1", alpha.base_port());

    let caught_up = wait_until(Duration::from_secs(5), || {
        bravo.cursor_for(alpha.node_id()) == 50
    })
    .await;
    assert!(caught_up, "cursor never reached the peer's head");

    for i in 0..50 {
        let triple = bravo
            .store()
            .get_triple(&format!("unit:{i}"), "status")
            .unwrap();
        assert_eq!(triple.unwrap().object, "ready");
    }

    alpha.stop().await;
    bravo.stop().await;
}

#[tokio::test]
async fn empty_replays_still_advance_and_persist_the_cursor() {
    let keys = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let nodes: Vec<NodeId> = ["Alpha", "Bravo"].iter().map(|n| NodeId::new(*n)).collect();
    provision::generate_mission_keys(&nodes, keys.path()).unwrap();

    let alpha = start_node("Alpha", keys.path(), data.path(), Duration::from_millis(100)).await;
    let bravo = start_node("Bravo", keys.path(), data.path(), Duration::from_millis(100)).await;

    for i in 0..5 {
        alpha.write(&format!("unit:{i}"), "status", "set").unwrap();
    }
    bravo.connect_peer(alpha.node_id(), "127.0.0.1", alpha.base_port());

    assert!(
        wait_until(Duration::from_secs(5), || {
            bravo.cursor_for(alpha.node_id()) == 5
        })
        .await
    );

    // Several more rounds of empty replays must not move the cursor.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(bravo.cursor_for(alpha.node_id()), 5);

    let alpha_id = alpha.node_id().clone();
    bravo.stop().await;
    drop(bravo);
    // Let the aborted workers release the store.
    sleep(Duration::from_millis(200)).await;

    let bravo = start_node("Bravo", keys.path(), data.path(), Duration::from_millis(100)).await;
    assert_eq!(
        bravo.cursor_for(&alpha_id),
        5,
        "cursors must be reloaded from disk on restart"
    );

    alpha.stop().await;
    bravo.stop().await;
}

#[tokio::test]
async fn flash_floods_cross_a_multi_hop_path() {
    let keys = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let nodes: Vec<NodeId> = ["Alpha", "Bravo", "Charlie"]
        .iter()
        .map(|n| NodeId::new(*n))
        .collect();
    provision::generate_mission_keys(&nodes, keys.path()).unwrap();

    // Long gossip interval so only the FLASH path can move data.
    let quiet = Duration::from_secs(60);
    let alpha = start_node("Alpha", keys.path(), data.path(), quiet).await;
    let bravo = start_node("Bravo", keys.path(), data.path(), quiet).await;
    let charlie = start_node("Charlie", keys.path(), data.path(), quiet).await;

    // Line topology: Alpha - Bravo - Charlie.
    link(&alpha, &bravo);
    link(&bravo, &charlie);

    alpha
        .write_priority("strike:1", "orders", "FIRE_MISSION")
        .unwrap();

    let reached = wait_until(Duration::from_secs(3), || {
        matches!(
            charlie.store().get_triple("strike:1", "orders"),
            Ok(Some(t)) if t.object == "FIRE_MISSION"
        )
    })
    .await;
    assert!(reached, "FLASH flood never crossed the two-hop path");

    alpha.stop().await;
    bravo.stop().await;
    charlie.stop().await;
}

#[tokio::test]
async fn duplicate_floods_mutate_each_store_once() {
    let keys = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let nodes: Vec<NodeId> = ["Alpha", "Bravo", "Charlie", "Ghost"]
        .iter()
        .map(|n| NodeId::new(*n))
        .collect();
    provision::generate_mission_keys(&nodes, keys.path()).unwrap();

    let quiet = Duration::from_secs(60);
    let alpha = start_node("Alpha", keys.path(), data.path(), quiet).await;
    let bravo = start_node("Bravo", keys.path(), data.path(), quiet).await;
    let charlie = start_node("Charlie", keys.path(), data.path(), quiet).await;
    link(&alpha, &bravo);
    link(&bravo, &charlie);

    let (ghost, _shutdown) = injector("Ghost", keys.path(), 64, &bravo).await;

    // The identical envelope, injected twice.
    let envelope = triple_envelope("Ghost", 0, "strike:2", "orders", "HOLD", &[("Ghost", 1)]);
    let raw = envelope.encode().unwrap();
    ghost.send(bravo.node_id(), Lane::Flash, raw.clone());
    ghost.send(bravo.node_id(), Lane::Flash, raw);

    let spread = wait_until(Duration::from_secs(3), || {
        matches!(
            charlie.store().get_triple("strike:2", "orders"),
            Ok(Some(t)) if t.object == "HOLD"
        )
    })
    .await;
    assert!(spread, "flood never reached the far node");

    // Give any duplicate time to do damage, then count mutations.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(bravo.store().head_seq(), 1);
    assert_eq!(charlie.store().head_seq(), 1);
    assert_eq!(alpha.store().head_seq(), 1);

    alpha.stop().await;
    bravo.stop().await;
    charlie.stop().await;
}

#[tokio::test]
async fn flash_is_handled_promptly_despite_a_bulk_backlog() {
    let keys = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let nodes: Vec<NodeId> = ["Alpha", "Ghost"].iter().map(|n| NodeId::new(*n)).collect();
    provision::generate_mission_keys(&nodes, keys.path()).unwrap();

    let quiet = Duration::from_secs(60);
    let alpha = start_node("Alpha", keys.path(), data.path(), quiet).await;
    let (ghost, _shutdown) = injector("Ghost", keys.path(), 2048, &alpha).await;

    // Pile up low-priority traffic first.
    for i in 0..300u64 {
        let env = triple_envelope(
            "Ghost",
            i + 1,
            &format!("tile:{i}"),
            "map_data",
            "blob",
            &[("Ghost", i + 1)],
        );
        ghost.send(alpha.node_id(), Lane::Bulk, env.encode().unwrap());
    }

    let env = triple_envelope("Ghost", 1000, "strike:3", "orders", "MOVE", &[("Ghost", 1000)]);
    ghost.send(alpha.node_id(), Lane::Flash, env.encode().unwrap());

    // Strict triage: the FLASH frame must not queue behind the backlog.
    let prompt = wait_until(Duration::from_secs(2), || {
        matches!(
            alpha.store().get_triple("strike:3", "orders"),
            Ok(Some(t)) if t.object == "MOVE"
        )
    })
    .await;
    assert!(prompt, "FLASH message was starved by BULK traffic");

    alpha.stop().await;
}

#[tokio::test]
async fn revocation_severs_a_peer_mesh_wide() {
    let keys = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let nodes: Vec<NodeId> = ["Alpha", "Bravo", "Charlie"]
        .iter()
        .map(|n| NodeId::new(*n))
        .collect();
    provision::generate_mission_keys(&nodes, keys.path()).unwrap();

    let quiet = Duration::from_secs(60);
    let alpha = start_node("Alpha", keys.path(), data.path(), quiet).await;
    let bravo = start_node("Bravo", keys.path(), data.path(), quiet).await;
    let charlie = start_node("Charlie", keys.path(), data.path(), quiet).await;
    link(&alpha, &bravo);
    link(&bravo, &charlie);
    link(&alpha, &charlie);

    // State accepted from Bravo before the revocation.
    bravo
        .write_priority("unit:bravo", "status", "present")
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            matches!(
                charlie.store().get_triple("unit:bravo", "status"),
                Ok(Some(_))
            )
        })
        .await
    );

    alpha.broadcast_revocation(&NodeId::new("Bravo")).unwrap();

    let propagated = wait_until(Duration::from_secs(3), || {
        !alpha.registry().contains(&NodeId::new("Bravo"))
            && !charlie.registry().contains(&NodeId::new("Bravo"))
    })
    .await;
    assert!(propagated, "revocation order never reached the mesh");

    // Previously accepted state is not rolled back.
    assert!(matches!(
        charlie.store().get_triple("unit:bravo", "status"),
        Ok(Some(_))
    ));

    // Nothing Bravo says from now on lands anywhere.
    bravo
        .write_priority("unit:bravo", "status", "still-here")
        .unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(
        charlie
            .store()
            .get_triple("unit:bravo", "status")
            .unwrap()
            .map(|t| t.object)
            != Some("still-here".to_string()),
        "a revoked identity was still able to write into the mesh"
    );

    alpha.stop().await;
    bravo.stop().await;
    charlie.stop().await;
}
