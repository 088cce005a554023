//! Vector clocks for causal ordering across the mesh.
//!
//! A vector clock tracks the happens-before relationship between writes
//! produced on different nodes. Each node maintains a monotone counter; a
//! clock maps node ids to the highest counter value observed from that node.
//! Absent entries read as zero.
//!
//! These are pure value operations with no I/O. `merge` is commutative,
//! associative, and idempotent; `compare` implements the standard partial
//! order with an explicit `Concurrent` outcome for incomparable clocks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::NodeId;

/// The causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Every entry of the left clock is <= the right, at least one strictly
    Before,
    /// Every entry of the right clock is <= the left, at least one strictly
    After,
    /// All entries equal (missing entries count as zero on both sides)
    Equal,
    /// Neither dominates the other
    Concurrent,
}

/// Per-node monotone counters capturing causal history.
///
/// Backed by a `BTreeMap` so iteration and serialization are deterministic
/// across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter recorded for `node`, zero if absent.
    pub fn get(&self, node: &NodeId) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    /// Record a local event: raise our own counter by one.
    pub fn increment(&mut self, node: &NodeId) {
        *self.counters.entry(node.clone()).or_insert(0) += 1;
    }

    /// Merge another clock into this one, taking the elementwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, counter) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    /// Compare two clocks under the standard vector-clock partial order.
    pub fn compare(a: &VectorClock, b: &VectorClock) -> Causality {
        let mut a_ahead = false;
        let mut b_ahead = false;

        for node in a.counters.keys().chain(b.counters.keys()) {
            match a.get(node).cmp(&b.get(node)) {
                std::cmp::Ordering::Greater => a_ahead = true,
                std::cmp::Ordering::Less => b_ahead = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (a_ahead, b_ahead) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Iterate over the recorded `(node, counter)` entries.
    pub fn entries(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.counters.iter().map(|(n, c)| (n, *c))
    }

    /// Number of nodes with a recorded entry.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True when no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries
            .iter()
            .map(|(n, c)| (NodeId::new(*n), *c))
            .collect()
    }

    #[test]
    fn increment_raises_own_counter() {
        let alpha = NodeId::new("Alpha");
        let mut vc = VectorClock::new();
        vc.increment(&alpha);
        vc.increment(&alpha);
        assert_eq!(vc.get(&alpha), 2);
    }

    #[test]
    fn merge_takes_elementwise_max() {
        let mut a = clock(&[("Alpha", 3), ("Bravo", 1)]);
        let b = clock(&[("Bravo", 4), ("Charlie", 2)]);
        a.merge(&b);
        assert_eq!(a, clock(&[("Alpha", 3), ("Bravo", 4), ("Charlie", 2)]));
    }

    #[test]
    fn compare_ordered_clocks() {
        let earlier = clock(&[("Alpha", 1)]);
        let later = clock(&[("Alpha", 2), ("Bravo", 1)]);
        assert_eq!(VectorClock::compare(&earlier, &later), Causality::Before);
        assert_eq!(VectorClock::compare(&later, &earlier), Causality::After);
    }

    #[test]
    fn compare_treats_missing_entries_as_zero() {
        let a = clock(&[("Alpha", 1), ("Bravo", 0)]);
        let b = clock(&[("Alpha", 1)]);
        assert_eq!(VectorClock::compare(&a, &b), Causality::Equal);
    }

    #[test]
    fn compare_detects_concurrency() {
        let a = clock(&[("Alpha", 2), ("Bravo", 1)]);
        let b = clock(&[("Alpha", 1), ("Bravo", 2)]);
        assert_eq!(VectorClock::compare(&a, &b), Causality::Concurrent);
        assert_eq!(VectorClock::compare(&b, &a), Causality::Concurrent);
    }

    #[test]
    fn empty_clocks_are_equal() {
        assert_eq!(
            VectorClock::compare(&VectorClock::new(), &VectorClock::new()),
            Causality::Equal
        );
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        proptest::collection::btree_map("[A-D]", 0u64..5, 0..4).prop_map(|m| {
            m.into_iter()
                .map(|(n, c)| (NodeId::new(n), c))
                .collect::<VectorClock>()
        })
    }

    proptest! {
        #[test]
        fn compare_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
            let forward = VectorClock::compare(&a, &b);
            let backward = VectorClock::compare(&b, &a);
            let expected = match forward {
                Causality::Before => Causality::After,
                Causality::After => Causality::Before,
                Causality::Equal => Causality::Equal,
                Causality::Concurrent => Causality::Concurrent,
            };
            prop_assert_eq!(backward, expected);
        }

        #[test]
        fn merge_is_idempotent(a in arb_clock(), b in arb_clock()) {
            let mut once = a.clone();
            once.merge(&b);
            let mut twice = once.clone();
            twice.merge(&b);
            prop_assert_eq!(&once, &twice);
        }

        #[test]
        fn merge_is_commutative(a in arb_clock(), b in arb_clock()) {
            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn merged_clock_dominates_both_inputs(a in arb_clock(), b in arb_clock()) {
            let mut merged = a.clone();
            merged.merge(&b);
            for side in [&a, &b] {
                let rel = VectorClock::compare(&merged, side);
                prop_assert!(matches!(rel, Causality::After | Causality::Equal));
            }
        }
    }
}
