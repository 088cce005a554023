//! Wire envelope codec and the flood-terminating dedup cache.
//!
//! Every frame on every lane carries one JSON envelope:
//!
//! ```json
//! {"t": "triple", "p": {"s": "unit:1", "p": "status", "o": "moving", "vc": {"Alpha": 1}},
//!  "s": "Alpha", "ts": 1722470400.125, "id": "1722470400.125-7"}
//! ```
//!
//! `t` selects the payload shape under `p`; `s` is the original sender;
//! `ts` is the sender's wall clock at message creation and is treated as
//! opaque (nothing orders by it). The optional `id` extends the dedup
//! fingerprint with a monotonic per-sender counter so two messages built in
//! the same tick cannot collide; envelopes without it fall back to the bare
//! `ts` text, which keeps the legacy wire shape working.

use std::collections::{HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::MeshResult;
use crate::types::{LogEntry, NodeId};

/// Capacity of the dedup FIFO. Sized to stop flood storms, not to be an
/// exact delivery ledger.
pub const DEDUP_CAPACITY: usize = 1000;

/// A replicated fact as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleMsg {
    /// Subject
    pub s: String,
    /// Predicate
    pub p: String,
    /// Object
    pub o: String,
    /// Writer's vector-clock snapshot
    pub vc: VectorClock,
}

impl From<&LogEntry> for TripleMsg {
    fn from(entry: &LogEntry) -> Self {
        Self {
            s: entry.triple.subject.clone(),
            p: entry.triple.predicate.clone(),
            o: entry.triple.object.clone(),
            vc: entry.triple.clock.clone(),
        }
    }
}

/// Typed message payloads, tagged on the wire as `t` with body `p`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "p")]
pub enum Payload {
    /// A fact update
    #[serde(rename = "triple")]
    Triple(TripleMsg),
    /// Revocation order for a node identity
    #[serde(rename = "REVOKE")]
    Revoke {
        /// The identity to purge from the mesh
        target: NodeId,
    },
    /// Anti-entropy pull request: replay the log after `seq`
    #[serde(rename = "SYNC")]
    Sync {
        /// The requester's cursor
        seq: u64,
    },
    /// Anti-entropy reply
    #[serde(rename = "ACK")]
    Ack {
        /// Log entries after the requested cursor, ascending
        u: Vec<TripleMsg>,
        /// New cursor: the sequence of the last entry sent
        h: u64,
    },
}

/// The wire message: payload plus sender, timestamp, and optional explicit
/// dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload (`t` + `p` on the wire)
    #[serde(flatten)]
    pub payload: Payload,
    /// Original sender
    pub s: NodeId,
    /// Sender's wall clock at creation, seconds
    pub ts: f64,
    /// Explicit dedup key; absent means fingerprint by `(s, ts)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Message fingerprint used by the dedup cache.
pub type Fingerprint = (NodeId, String);

impl Envelope {
    /// Build an envelope stamped with the current wall clock and the given
    /// per-sender counter value.
    pub fn new(payload: Payload, sender: NodeId, counter: u64) -> Self {
        let ts = wall_clock_ts();
        Self {
            payload,
            s: sender,
            ts,
            id: Some(format!("{ts}-{counter}")),
        }
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from the wire form.
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The dedup fingerprint: the explicit `id` when present, otherwise
    /// the timestamp text.
    pub fn fingerprint(&self) -> Fingerprint {
        let key = match &self.id {
            Some(id) => id.clone(),
            None => self.ts.to_string(),
        };
        (self.s.clone(), key)
    }
}

/// Sender's wall clock as fractional seconds since the epoch.
pub fn wall_clock_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Bounded FIFO of recently seen message fingerprints.
///
/// `observe` returns true exactly once per fingerprint while it remains in
/// the window; the oldest entry is evicted when the window is full.
pub struct DedupCache {
    capacity: usize,
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
}

impl DedupCache {
    /// Create a cache bounded to `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a sighting. Returns true when the fingerprint is fresh.
    pub fn observe(&mut self, fingerprint: Fingerprint) -> bool {
        if self.seen.contains(&fingerprint) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(fingerprint.clone());
        self.seen.insert(fingerprint);
        true
    }

    /// Number of fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_the_compact_field_names() {
        let env = Envelope::new(
            Payload::Sync { seq: 42 },
            NodeId::new("Alpha"),
            7,
        );
        let json: serde_json::Value =
            serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert_eq!(json["t"], "SYNC");
        assert_eq!(json["p"]["seq"], 42);
        assert_eq!(json["s"], "Alpha");
        assert!(json["ts"].is_f64());
    }

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::new(
            Payload::Triple(TripleMsg {
                s: "unit:1".into(),
                p: "status".into(),
                o: "moving".into(),
                vc: [(NodeId::new("Alpha"), 1)].into_iter().collect(),
            }),
            NodeId::new("Alpha"),
            0,
        );

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.fingerprint(), env.fingerprint());
        match decoded.payload {
            Payload::Triple(t) => {
                assert_eq!(t.o, "moving");
                assert_eq!(t.vc.get(&NodeId::new("Alpha")), 1);
            }
            other => panic!("expected triple payload, got {other:?}"),
        }
    }

    #[test]
    fn legacy_envelope_without_id_still_decodes_and_fingerprints() {
        let raw = br#"{"t":"REVOKE","p":{"target":"Bravo"},"s":"Alpha","ts":1000.5}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.fingerprint(), (NodeId::new("Alpha"), "1000.5".to_string()));
    }

    #[test]
    fn dedup_reports_each_fingerprint_once() {
        let mut cache = DedupCache::new(DEDUP_CAPACITY);
        let fp = (NodeId::new("Alpha"), "1-1".to_string());
        assert!(cache.observe(fp.clone()));
        assert!(!cache.observe(fp));
    }

    #[test]
    fn dedup_evicts_oldest_when_full() {
        let mut cache = DedupCache::new(3);
        for i in 0..4 {
            assert!(cache.observe((NodeId::new("Alpha"), format!("{i}"))));
        }
        assert_eq!(cache.len(), 3);
        // The first fingerprint fell out of the window and reads as fresh.
        assert!(cache.observe((NodeId::new("Alpha"), "0".to_string())));
    }
}
