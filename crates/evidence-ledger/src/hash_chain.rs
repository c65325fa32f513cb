//! Hash Chain Authority — canonical payload hashing and gapless per-source
//! sequence allocation.
//!
//! Every source system owns one chain. Allocation of `(sequence, previous_hash)`
//! and persistence of the event happen under that source's lock, and the store
//! re-checks the head on write, so two writers can never claim the same
//! sequence number. Different sources never share a lock.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{LedgerError, LedgerResult};
use crate::store::EvidenceStore;
use crate::types::{ContentHash, Event};

/// Rebuild a JSON value with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON bytes of the canonical form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    // Serializing a `Value` cannot fail: keys are strings and numbers are finite.
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}

pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash(hex::encode(Sha256::digest(bytes)))
}

/// Deterministic SHA-256 over the canonical serialization of `payload`.
pub fn compute_hash(payload: &Value) -> ContentHash {
    hash_bytes(&canonical_bytes(payload))
}

/// Hash any serializable record through its canonical JSON form.
pub fn hash_record<T: Serialize>(record: &T) -> LedgerResult<ContentHash> {
    let value = serde_json::to_value(record)?;
    Ok(compute_hash(&value))
}

/// Sequence number and predecessor hash allocated for the next event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub sequence: u64,
    pub previous_hash: ContentHash,
}

/// Allocates chain links and appends events atomically per source.
pub struct HashChainAuthority {
    store: Arc<dyn EvidenceStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl HashChainAuthority {
    pub fn new(store: Arc<dyn EvidenceStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn source_lock(&self, source_system: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(source_system.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Allocate the next link for `source_system`, build the event with it,
    /// and persist it. Either the event is durable with a contiguous link or
    /// nothing is written and `ChainConflict` is returned.
    pub async fn append<F>(&self, source_system: &str, build: F) -> LedgerResult<Event>
    where
        F: FnOnce(ChainLink) -> Event,
    {
        let lock = self.source_lock(source_system);
        let _guard = lock.lock().await;

        let head = self.store.chain_head(source_system)?;
        let expected_head = head.as_ref().map(|h| h.sequence);
        let link = match head {
            Some(h) => ChainLink {
                sequence: h.sequence + 1,
                previous_hash: h.payload_hash,
            },
            None => ChainLink {
                sequence: 1,
                previous_hash: ContentHash::genesis(),
            },
        };

        let event = build(link.clone());
        if event.source_system != source_system
            || event.sequence_number != link.sequence
            || event.previous_hash != link.previous_hash
        {
            return Err(LedgerError::ChainConflict {
                source_system: source_system.to_string(),
                detail: format!(
                    "event built with link ({}, {}) but allocated ({}, {})",
                    event.sequence_number, event.previous_hash, link.sequence, link.previous_hash
                ),
            });
        }
        if event.payload_hash != compute_hash(&event.payload) {
            return Err(LedgerError::Validation(format!(
                "payload hash of event {} does not match its payload",
                event.event_id
            )));
        }

        self.store.append_event(event.clone(), expected_head)?;
        tracing::debug!(
            "chained {} #{} on '{}'",
            event.event_type,
            event.sequence_number,
            source_system
        );
        Ok(event)
    }

    /// Walk a source's events and check every link.
    pub fn verify_chain(&self, source_system: &str) -> LedgerResult<ChainReport> {
        let events = self.store.events_for_source(source_system)?;
        Ok(verify_events(source_system, &events))
    }
}

/// Where a chain first fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBreak {
    pub position: usize,
    pub event_id: String,
    pub reason: String,
}

/// Result of verifying one source's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub source_system: String,
    pub length: usize,
    pub head_hash: Option<ContentHash>,
    pub intact: bool,
    pub first_break: Option<ChainBreak>,
}

/// Verify contiguity, genesis, linkage, and payload hashes of `events`
/// (expected in sequence order).
pub fn verify_events(source_system: &str, events: &[Event]) -> ChainReport {
    let mut first_break = None;
    let mut prev_hash = ContentHash::genesis();

    for (i, event) in events.iter().enumerate() {
        let expected_seq = i as u64 + 1;
        let reason = if event.source_system != source_system {
            Some(format!("belongs to source '{}'", event.source_system))
        } else if event.sequence_number != expected_seq {
            Some(format!(
                "sequence {} where {expected_seq} was expected",
                event.sequence_number
            ))
        } else if event.previous_hash != prev_hash {
            Some(format!(
                "previous hash {} does not match {}",
                event.previous_hash, prev_hash
            ))
        } else if event.payload_hash != compute_hash(&event.payload) {
            Some("payload hash does not match payload".to_string())
        } else {
            None
        };

        if let Some(reason) = reason {
            first_break = Some(ChainBreak {
                position: i,
                event_id: event.event_id.clone(),
                reason,
            });
            break;
        }
        prev_hash = event.payload_hash.clone();
    }

    ChainReport {
        source_system: source_system.to_string(),
        length: events.len(),
        head_hash: events.last().map(|e| e.payload_hash.clone()),
        intact: first_break.is_none(),
        first_break,
    }
}
