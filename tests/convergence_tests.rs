//! Convergence property tests: replicas that observe the same set of
//! writes, in any order, must agree on every key.

use tacmesh::clock::VectorClock;
use tacmesh::store::TripleStore;
use tacmesh::types::NodeId;
use tempfile::TempDir;

#[derive(Clone)]
struct Write {
    subject: &'static str,
    predicate: &'static str,
    object: &'static str,
    clock: VectorClock,
    writer: NodeId,
}

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    entries
        .iter()
        .map(|(n, c)| (NodeId::new(*n), *c))
        .collect()
}

fn remote_write(
    subject: &'static str,
    predicate: &'static str,
    object: &'static str,
    entries: &[(&str, u64)],
    writer: &str,
) -> Write {
    Write {
        subject,
        predicate,
        object,
        clock: clock(entries),
        writer: NodeId::new(writer),
    }
}

/// All orderings of `items` (small inputs only).
fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for (i, head) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

fn final_state(order: &[Write]) -> Vec<(String, String, String)> {
    let dir = TempDir::new().unwrap();
    let store = TripleStore::open(dir.path().join("db"), NodeId::new("Observer")).unwrap();

    for w in order {
        store
            .write_remote(w.subject, w.predicate, w.object, &w.clock, &w.writer)
            .unwrap();
    }

    let mut state = Vec::new();
    for w in order {
        if let Some(t) = store.get_triple(w.subject, w.predicate).unwrap() {
            state.push((w.subject.to_string(), w.predicate.to_string(), t.object));
        }
    }
    state.sort();
    state.dedup();
    state
}

#[test]
fn every_delivery_order_reaches_the_same_state() {
    // A causal chain on one key, a concurrent pair on another, and an
    // unrelated key that only one node ever writes.
    let writes = vec![
        remote_write("unit:1", "status", "staging", &[("Alpha", 1)], "Alpha"),
        remote_write(
            "unit:1",
            "status",
            "moving",
            &[("Alpha", 2), ("Bravo", 1)],
            "Bravo",
        ),
        remote_write("unit:2", "fuel", "40", &[("Alpha", 1), ("Bravo", 2)], "Bravo"),
        remote_write(
            "unit:2",
            "fuel",
            "75",
            &[("Alpha", 1), ("Charlie", 1)],
            "Charlie",
        ),
        remote_write("unit:3", "ammo", "full", &[("Charlie", 2)], "Charlie"),
    ];

    let baseline = final_state(&writes);
    assert!(!baseline.is_empty());

    for order in permutations(&writes) {
        let state = final_state(&order);
        assert_eq!(
            state, baseline,
            "replicas diverged for delivery order {:?}",
            order.iter().map(|w| w.object).collect::<Vec<_>>()
        );
    }
}

#[test]
fn concurrent_pair_resolves_to_the_larger_object_everywhere() {
    let writes = vec![
        remote_write("point:9", "marker", "AAA", &[("Alpha", 1), ("Bravo", 1)], "Alpha"),
        remote_write(
            "point:9",
            "marker",
            "ZZZ",
            &[("Alpha", 1), ("Charlie", 1)],
            "Charlie",
        ),
    ];

    for order in permutations(&writes) {
        let state = final_state(&order);
        assert_eq!(
            state,
            vec![(
                "point:9".to_string(),
                "marker".to_string(),
                "ZZZ".to_string()
            )]
        );
    }
}

#[test]
fn redelivering_the_same_write_mutates_the_store_once() {
    let dir = TempDir::new().unwrap();
    let store = TripleStore::open(dir.path().join("db"), NodeId::new("Observer")).unwrap();

    let w = remote_write("unit:1", "status", "moving", &[("Alpha", 3)], "Alpha");
    for _ in 0..5 {
        store
            .write_remote(w.subject, w.predicate, w.object, &w.clock, &w.writer)
            .unwrap();
    }

    assert_eq!(store.head_seq(), 1, "retransmits must not inflate the log");
    let (entries, _) = store.get_logs_since(0, 100).unwrap();
    assert_eq!(entries.len(), 1);
}
