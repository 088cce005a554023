//! The replicated triple store.
//!
//! A durable, crash-safe keyed store of triples with a replay log and
//! deterministic last-writer-wins-under-conflict semantics. The store keeps
//! three sled trees:
//!
//! - `facts` — latest triple per `(subject, predicate)` key
//! - `log` — replication log, keyed by zero-padded sequence number so a
//!   range scan replays entries in order
//! - `meta` — the node's own vector clock and the sequence counter
//!
//! Every accepted write commits the new fact, its log entry, the merged own
//! clock, and the bumped sequence counter as a single cross-tree
//! transaction, so a crash can never separate the latest view from the log.
//!
//! # Convergence rule
//!
//! An incoming write with clock `W` against an existing triple with clock
//! `E` resolves as:
//!
//! | relation       | action                                              |
//! |----------------|-----------------------------------------------------|
//! | `W` before `E` | reject (stale)                                      |
//! | `W` after `E`  | accept                                              |
//! | equal          | duplicate: merge clock only, no sequence bump       |
//! | concurrent     | larger `object` byte string wins; full tie rejects  |
//!
//! The concurrent branch is what makes replicas agree regardless of arrival
//! order: every node picks the same winner from the object bytes alone.

use std::path::Path;
use std::sync::Mutex;

use sled::transaction::TransactionError;
use sled::Transactional;

use crate::clock::{Causality, VectorClock};
use crate::error::{MeshError, MeshResult};
use crate::types::{LogEntry, NodeId, StoreKey, Triple};

const META_CLOCK: &[u8] = b"clock";
const META_SEQ: &[u8] = b"seq";

/// Width of the zero-padded decimal log key.
const LOG_KEY_WIDTH: usize = 12;

/// Outcome of a `write_triple` call. A rejection is not an error: it means
/// the convergence rule already holds a revision that wins over this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was committed and assigned a new log sequence number
    Accepted,
    /// The write was stale, a duplicate, or lost a concurrent tiebreak
    Rejected,
}

impl WriteOutcome {
    /// True when the write was committed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteOutcome::Accepted)
    }
}

struct StoreState {
    clock: VectorClock,
    seq: u64,
}

/// Durable keyed store of triples with a replication log.
///
/// Writes are serialized internally; the store is safe to share behind an
/// `Arc` and call from multiple tasks.
pub struct TripleStore {
    node: NodeId,
    db: sled::Db,
    facts: sled::Tree,
    log: sled::Tree,
    meta: sled::Tree,
    state: Mutex<StoreState>,
}

impl TripleStore {
    /// Open (or create) the store at `path` for the given node.
    ///
    /// On reopen the own clock and sequence counter are recovered from the
    /// `meta` tree; the head sequence is cross-checked against the largest
    /// log key physically present.
    pub fn open(path: impl AsRef<Path>, node: NodeId) -> MeshResult<Self> {
        let db = sled::open(path)?;
        let facts = db.open_tree("facts")?;
        let log = db.open_tree("log")?;
        let meta = db.open_tree("meta")?;

        let clock = match meta.get(META_CLOCK)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| MeshError::Corruption {
                key: "meta/clock".to_string(),
                reason: e.to_string(),
            })?,
            None => VectorClock::new(),
        };

        let recorded_seq = match meta.get(META_SEQ)? {
            Some(raw) => decode_seq(&raw)?,
            None => 0,
        };
        // An accepted write commits meta and log together, so these agree
        // unless the file was produced by a different tool.
        let physical_seq = match log.last()? {
            Some((key, _)) => parse_log_key(&key)?,
            None => 0,
        };
        let seq = recorded_seq.max(physical_seq);

        Ok(Self {
            node,
            db,
            facts,
            log,
            meta,
            state: Mutex::new(StoreState { clock, seq }),
        })
    }

    /// The node this store belongs to.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Commit a local write. The own counter is incremented and the
    /// resulting clock snapshot becomes the triple's causal context.
    pub fn write_local(&self, subject: &str, predicate: &str, object: &str) -> MeshResult<WriteOutcome> {
        self.write_triple(subject, predicate, object, None)
    }

    /// Apply a write received from a peer. `clock` is the writer's snapshot
    /// carried on the wire and `writer` is the authenticated sender.
    pub fn write_remote(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        clock: &VectorClock,
        writer: &NodeId,
    ) -> MeshResult<WriteOutcome> {
        self.write_triple(subject, predicate, object, Some((clock, writer)))
    }

    fn write_triple(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        remote: Option<(&VectorClock, &NodeId)>,
    ) -> MeshResult<WriteOutcome> {
        let key = StoreKey::new(subject, predicate);
        let key_bytes = key.encode();

        let mut state = self.state.lock().expect("store state poisoned");

        let (write_clock, writer) = match remote {
            Some((clock, writer)) => (clock.clone(), writer.clone()),
            None => {
                let mut snapshot = state.clock.clone();
                snapshot.increment(&self.node);
                (snapshot, self.node.clone())
            }
        };

        if let Some(existing) = self.read_fact(&key_bytes, &key)? {
            match VectorClock::compare(&write_clock, &existing.clock) {
                Causality::Before => return Ok(WriteOutcome::Rejected),
                Causality::Equal => {
                    // Retransmit of a revision we already hold. Folding the
                    // clock in keeps anti-entropy accounting accurate
                    // without inflating the sequence.
                    self.merge_clock_only(&mut state, &write_clock)?;
                    return Ok(WriteOutcome::Rejected);
                }
                Causality::Concurrent => {
                    if object.as_bytes() <= existing.object.as_bytes() {
                        self.merge_clock_only(&mut state, &write_clock)?;
                        return Ok(WriteOutcome::Rejected);
                    }
                }
                Causality::After => {}
            }
        }

        let mut merged_clock = state.clock.clone();
        merged_clock.merge(&write_clock);
        let new_seq = state.seq + 1;

        let triple = Triple {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object: object.to_string(),
            clock: write_clock,
            writer,
        };
        let blob = bincode::serialize(&triple)?;
        let clock_bytes = serde_json::to_vec(&merged_clock)?;
        let seq_key = log_key(new_seq);

        let result: Result<(), TransactionError<()>> = (&self.facts, &self.log, &self.meta)
            .transaction(|(facts, log, meta)| {
                facts.insert(key_bytes.as_slice(), blob.as_slice())?;
                log.insert(seq_key.as_slice(), blob.as_slice())?;
                meta.insert(META_CLOCK, clock_bytes.as_slice())?;
                meta.insert(META_SEQ, new_seq.to_be_bytes().to_vec())?;
                Ok(())
            });
        result.map_err(|err| match err {
            TransactionError::Storage(e) => MeshError::Storage(e),
            // The closure never aborts.
            TransactionError::Abort(()) => {
                MeshError::Storage(sled::Error::Unsupported("batch aborted".to_string()))
            }
        })?;

        // The in-memory mirrors advance only after the batch lands, so a
        // failed commit leaves the clock untouched.
        state.clock = merged_clock;
        state.seq = new_seq;
        Ok(WriteOutcome::Accepted)
    }

    fn merge_clock_only(&self, state: &mut StoreState, other: &VectorClock) -> MeshResult<()> {
        let mut merged = state.clock.clone();
        merged.merge(other);
        if merged != state.clock {
            self.meta.insert(META_CLOCK, serde_json::to_vec(&merged)?)?;
            state.clock = merged;
        }
        Ok(())
    }

    fn read_fact(&self, key_bytes: &[u8], key: &StoreKey) -> MeshResult<Option<Triple>> {
        match self.facts.get(key_bytes)? {
            Some(raw) => {
                let triple = bincode::deserialize(&raw).map_err(|e| MeshError::Corruption {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(triple))
            }
            None => Ok(None),
        }
    }

    /// Point lookup of the current winner for `(subject, predicate)`.
    /// An unknown key yields `Ok(None)`.
    pub fn get_triple(&self, subject: &str, predicate: &str) -> MeshResult<Option<Triple>> {
        let key = StoreKey::new(subject, predicate);
        self.read_fact(&key.encode(), &key)
    }

    /// Return up to `limit` consecutive log entries with sequence strictly
    /// greater than `cursor`, in ascending order, together with the
    /// sequence of the last entry returned (`cursor` if none).
    pub fn get_logs_since(&self, cursor: u64, limit: usize) -> MeshResult<(Vec<LogEntry>, u64)> {
        let mut entries = Vec::new();
        let mut head = cursor;
        let start = log_key(cursor.saturating_add(1));

        for item in self.log.range(start.as_slice()..) {
            if entries.len() >= limit {
                break;
            }
            let (raw_key, raw_value) = item?;
            let seq = parse_log_key(&raw_key)?;
            let triple = bincode::deserialize(&raw_value).map_err(|e| MeshError::Corruption {
                key: format!("log/{seq}"),
                reason: e.to_string(),
            })?;
            entries.push(LogEntry { seq, triple });
            head = seq;
        }

        Ok((entries, head))
    }

    /// Snapshot of the store's own vector clock.
    pub fn own_clock(&self) -> VectorClock {
        self.state.lock().expect("store state poisoned").clock.clone()
    }

    /// The largest sequence number assigned so far.
    pub fn head_seq(&self) -> u64 {
        self.state.lock().expect("store state poisoned").seq
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> MeshResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Flush and release the store. Dropping the value releases the
    /// underlying files; this just makes the flush explicit.
    pub fn close(&self) -> MeshResult<()> {
        self.flush()
    }
}

fn log_key(seq: u64) -> Vec<u8> {
    format!("{seq:0width$}", width = LOG_KEY_WIDTH).into_bytes()
}

fn parse_log_key(raw: &[u8]) -> MeshResult<u64> {
    let text = std::str::from_utf8(raw).map_err(|e| MeshError::Corruption {
        key: "log".to_string(),
        reason: e.to_string(),
    })?;
    text.parse().map_err(|_| MeshError::Corruption {
        key: format!("log/{text}"),
        reason: "log key is not a sequence number".to_string(),
    })
}

fn decode_seq(raw: &[u8]) -> MeshResult<u64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| MeshError::Corruption {
        key: "meta/seq".to_string(),
        reason: "sequence record has wrong length".to_string(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}
