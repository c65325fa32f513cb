//! Repository interfaces and the in-memory primary store.
//!
//! The concrete schema of a production store is not part of this crate; any
//! backend implements [`EvidenceStore`] (and [`AlertStore`] for alerts). The
//! compare-and-set methods are the only way to mutate a record after
//! insertion, which keeps chain allocation and clock/alert transitions
//! first-writer-wins.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::{
    Alert, AlertStatus, Artifact, Clock, ClockStatus, ContentHash, Decision, Edge, Event,
    LinkageGap, NodeRef, TimestampSubject, TsaTimestamp,
};

/// Errors raised by a repository backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate {entity} id {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: String },

    #[error("chain head for '{source_system}' moved: expected {expected:?}, found {found:?}")]
    ChainHeadMoved {
        source_system: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("{entity} {id} status is {actual}, expected {expected}")]
    StatusMismatch {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Last link of a source's hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: u64,
    pub payload_hash: ContentHash,
}

/// Repository for everything except alerts.
pub trait EvidenceStore: Send + Sync {
    fn chain_head(&self, source_system: &str) -> StoreResult<Option<ChainHead>>;

    /// Persist `event` only if the source's head sequence still equals
    /// `expected_head` (`None` meaning the source has no events yet).
    fn append_event(&self, event: Event, expected_head: Option<u64>) -> StoreResult<()>;
    fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>>;
    /// Events of one source in sequence order.
    fn events_for_source(&self, source_system: &str) -> StoreResult<Vec<Event>>;
    fn events_for_correlation(&self, correlation_id: &str) -> StoreResult<Vec<Event>>;

    fn insert_decision(&self, decision: Decision) -> StoreResult<()>;
    fn get_decision(&self, decision_id: &str) -> StoreResult<Option<Decision>>;

    fn insert_artifact(&self, artifact: Artifact) -> StoreResult<()>;
    fn get_artifact(&self, artifact_id: &str) -> StoreResult<Option<Artifact>>;

    fn insert_clock(&self, clock: Clock) -> StoreResult<()>;
    fn get_clock(&self, clock_id: &str) -> StoreResult<Option<Clock>>;
    /// Clocks with the given status, earliest deadline first.
    fn clocks_with_status(&self, status: ClockStatus) -> StoreResult<Vec<Clock>>;
    fn clocks_for_event(&self, event_id: &str) -> StoreResult<Vec<Clock>>;
    /// Replace a clock only if its stored status equals `expected`.
    fn update_clock(&self, clock: Clock, expected: ClockStatus) -> StoreResult<()>;
    /// Claim a threshold notice. Returns `false` if it was already claimed.
    fn record_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<bool>;
    /// Give a notice back after the alert it guarded could not be raised.
    fn release_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<()>;
    fn has_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<bool>;

    fn insert_edge(&self, edge: Edge) -> StoreResult<()>;
    fn edges_from(&self, node: &NodeRef) -> StoreResult<Vec<Edge>>;
    fn edges_to(&self, node: &NodeRef) -> StoreResult<Vec<Edge>>;

    fn insert_timestamp(&self, timestamp: TsaTimestamp) -> StoreResult<()>;
    fn get_timestamp(&self, timestamp_id: &str) -> StoreResult<Option<TsaTimestamp>>;
    fn timestamps_for(&self, subject: &TimestampSubject) -> StoreResult<Vec<TsaTimestamp>>;

    fn insert_linkage_gap(&self, gap: LinkageGap) -> StoreResult<()>;
    fn get_linkage_gap(&self, gap_id: &str) -> StoreResult<Option<LinkageGap>>;
    /// Replace a gap only if its stored attempt count equals `expected_attempts`.
    fn update_linkage_gap(&self, gap: LinkageGap, expected_attempts: u32) -> StoreResult<()>;
    fn open_linkage_gaps(&self) -> StoreResult<Vec<LinkageGap>>;
}

/// Repository for alerts.
pub trait AlertStore: Send + Sync {
    fn insert_alert(&self, alert: Alert) -> StoreResult<()>;
    fn get_alert(&self, alert_id: &str) -> StoreResult<Option<Alert>>;
    /// Replace an alert only if its stored status equals `expected`.
    fn update_alert(&self, alert: Alert, expected: AlertStatus) -> StoreResult<()>;
    /// All alerts, oldest first.
    fn list_alerts(&self) -> StoreResult<Vec<Alert>>;
}

#[derive(Default)]
struct Tables {
    events: Vec<Event>,
    event_index: HashMap<String, usize>,
    source_index: HashMap<String, Vec<usize>>,
    heads: HashMap<String, ChainHead>,
    decisions: HashMap<String, Decision>,
    artifacts: HashMap<String, Artifact>,
    clocks: HashMap<String, Clock>,
    clock_notices: HashSet<(String, String)>,
    edges: Vec<Edge>,
    timestamps: HashMap<String, TsaTimestamp>,
    gaps: HashMap<String, LinkageGap>,
    gap_order: Vec<String>,
    alerts: HashMap<String, Alert>,
    alert_order: Vec<String>,
}

/// Process-local primary store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of persisted events across all sources.
    pub fn event_count(&self) -> usize {
        self.tables.read().events.len()
    }

    /// Total number of persisted edges.
    pub fn edge_count(&self) -> usize {
        self.tables.read().edges.len()
    }
}

fn duplicate(entity: &'static str, id: &str) -> StoreError {
    StoreError::Duplicate {
        entity,
        id: id.to_string(),
    }
}

impl EvidenceStore for InMemoryStore {
    fn chain_head(&self, source_system: &str) -> StoreResult<Option<ChainHead>> {
        Ok(self.tables.read().heads.get(source_system).cloned())
    }

    fn append_event(&self, event: Event, expected_head: Option<u64>) -> StoreResult<()> {
        let mut t = self.tables.write();
        let found = t.heads.get(&event.source_system).map(|h| h.sequence);
        if found != expected_head {
            return Err(StoreError::ChainHeadMoved {
                source_system: event.source_system,
                expected: expected_head,
                found,
            });
        }
        if t.event_index.contains_key(&event.event_id) {
            return Err(duplicate("event", &event.event_id));
        }

        let idx = t.events.len();
        t.event_index.insert(event.event_id.clone(), idx);
        t.source_index
            .entry(event.source_system.clone())
            .or_default()
            .push(idx);
        t.heads.insert(
            event.source_system.clone(),
            ChainHead {
                sequence: event.sequence_number,
                payload_hash: event.payload_hash.clone(),
            },
        );
        t.events.push(event);
        Ok(())
    }

    fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
        let t = self.tables.read();
        Ok(t.event_index.get(event_id).map(|&i| t.events[i].clone()))
    }

    fn events_for_source(&self, source_system: &str) -> StoreResult<Vec<Event>> {
        let t = self.tables.read();
        Ok(t.source_index
            .get(source_system)
            .map(|idxs| idxs.iter().map(|&i| t.events[i].clone()).collect())
            .unwrap_or_default())
    }

    fn events_for_correlation(&self, correlation_id: &str) -> StoreResult<Vec<Event>> {
        let t = self.tables.read();
        Ok(t.events
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    fn insert_decision(&self, decision: Decision) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.decisions.contains_key(&decision.decision_id) {
            return Err(duplicate("decision", &decision.decision_id));
        }
        t.decisions.insert(decision.decision_id.clone(), decision);
        Ok(())
    }

    fn get_decision(&self, decision_id: &str) -> StoreResult<Option<Decision>> {
        Ok(self.tables.read().decisions.get(decision_id).cloned())
    }

    fn insert_artifact(&self, artifact: Artifact) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.artifacts.contains_key(&artifact.artifact_id) {
            return Err(duplicate("artifact", &artifact.artifact_id));
        }
        t.artifacts.insert(artifact.artifact_id.clone(), artifact);
        Ok(())
    }

    fn get_artifact(&self, artifact_id: &str) -> StoreResult<Option<Artifact>> {
        Ok(self.tables.read().artifacts.get(artifact_id).cloned())
    }

    fn insert_clock(&self, clock: Clock) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.clocks.contains_key(&clock.clock_id) {
            return Err(duplicate("clock", &clock.clock_id));
        }
        t.clocks.insert(clock.clock_id.clone(), clock);
        Ok(())
    }

    fn get_clock(&self, clock_id: &str) -> StoreResult<Option<Clock>> {
        Ok(self.tables.read().clocks.get(clock_id).cloned())
    }

    fn clocks_with_status(&self, status: ClockStatus) -> StoreResult<Vec<Clock>> {
        let t = self.tables.read();
        let mut clocks: Vec<Clock> = t
            .clocks
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        clocks.sort_by(|a, b| a.deadline.cmp(&b.deadline).then(a.clock_id.cmp(&b.clock_id)));
        Ok(clocks)
    }

    fn clocks_for_event(&self, event_id: &str) -> StoreResult<Vec<Clock>> {
        let t = self.tables.read();
        let mut clocks: Vec<Clock> = t
            .clocks
            .values()
            .filter(|c| c.related_event_id == event_id)
            .cloned()
            .collect();
        clocks.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        Ok(clocks)
    }

    fn update_clock(&self, clock: Clock, expected: ClockStatus) -> StoreResult<()> {
        let mut t = self.tables.write();
        let current = t.clocks.get(&clock.clock_id).ok_or_else(|| StoreError::Missing {
            entity: "clock",
            id: clock.clock_id.clone(),
        })?;
        if current.status != expected {
            return Err(StoreError::StatusMismatch {
                entity: "clock",
                id: clock.clock_id.clone(),
                expected: expected.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }
        t.clocks.insert(clock.clock_id.clone(), clock);
        Ok(())
    }

    fn record_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<bool> {
        Ok(self
            .tables
            .write()
            .clock_notices
            .insert((clock_id.to_string(), threshold.to_string())))
    }

    fn release_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<()> {
        self.tables
            .write()
            .clock_notices
            .remove(&(clock_id.to_string(), threshold.to_string()));
        Ok(())
    }

    fn has_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<bool> {
        Ok(self
            .tables
            .read()
            .clock_notices
            .contains(&(clock_id.to_string(), threshold.to_string())))
    }

    fn insert_edge(&self, edge: Edge) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.edges.iter().any(|e| e.edge_id == edge.edge_id) {
            return Err(duplicate("edge", &edge.edge_id));
        }
        t.edges.push(edge);
        Ok(())
    }

    fn edges_from(&self, node: &NodeRef) -> StoreResult<Vec<Edge>> {
        let t = self.tables.read();
        Ok(t.edges
            .iter()
            .filter(|e| e.source_node_type == node.node_type && e.source_node_id == node.node_id)
            .cloned()
            .collect())
    }

    fn edges_to(&self, node: &NodeRef) -> StoreResult<Vec<Edge>> {
        let t = self.tables.read();
        Ok(t.edges
            .iter()
            .filter(|e| e.target_node_type == node.node_type && e.target_node_id == node.node_id)
            .cloned()
            .collect())
    }

    fn insert_timestamp(&self, timestamp: TsaTimestamp) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.timestamps.contains_key(&timestamp.timestamp_id) {
            return Err(duplicate("timestamp", &timestamp.timestamp_id));
        }
        t.timestamps
            .insert(timestamp.timestamp_id.clone(), timestamp);
        Ok(())
    }

    fn get_timestamp(&self, timestamp_id: &str) -> StoreResult<Option<TsaTimestamp>> {
        Ok(self.tables.read().timestamps.get(timestamp_id).cloned())
    }

    fn timestamps_for(&self, subject: &TimestampSubject) -> StoreResult<Vec<TsaTimestamp>> {
        let t = self.tables.read();
        Ok(t.timestamps
            .values()
            .filter(|ts| &ts.subject == subject)
            .cloned()
            .collect())
    }

    fn insert_linkage_gap(&self, gap: LinkageGap) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.gaps.contains_key(&gap.gap_id) {
            return Err(duplicate("linkage gap", &gap.gap_id));
        }
        t.gap_order.push(gap.gap_id.clone());
        t.gaps.insert(gap.gap_id.clone(), gap);
        Ok(())
    }

    fn get_linkage_gap(&self, gap_id: &str) -> StoreResult<Option<LinkageGap>> {
        Ok(self.tables.read().gaps.get(gap_id).cloned())
    }

    fn update_linkage_gap(&self, gap: LinkageGap, expected_attempts: u32) -> StoreResult<()> {
        let mut t = self.tables.write();
        let slot = t.gaps.get_mut(&gap.gap_id).ok_or_else(|| StoreError::Missing {
            entity: "linkage gap",
            id: gap.gap_id.clone(),
        })?;
        if slot.attempts != expected_attempts {
            return Err(StoreError::StatusMismatch {
                entity: "linkage gap",
                id: gap.gap_id.clone(),
                expected: format!("attempt {expected_attempts}"),
                actual: format!("attempt {}", slot.attempts),
            });
        }
        *slot = gap;
        Ok(())
    }

    fn open_linkage_gaps(&self) -> StoreResult<Vec<LinkageGap>> {
        let t = self.tables.read();
        Ok(t.gap_order
            .iter()
            .filter_map(|id| t.gaps.get(id))
            .filter(|g| g.resolved_at.is_none())
            .cloned()
            .collect())
    }
}

impl AlertStore for InMemoryStore {
    fn insert_alert(&self, alert: Alert) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.alerts.contains_key(&alert.alert_id) {
            return Err(duplicate("alert", &alert.alert_id));
        }
        t.alert_order.push(alert.alert_id.clone());
        t.alerts.insert(alert.alert_id.clone(), alert);
        Ok(())
    }

    fn get_alert(&self, alert_id: &str) -> StoreResult<Option<Alert>> {
        Ok(self.tables.read().alerts.get(alert_id).cloned())
    }

    fn update_alert(&self, alert: Alert, expected: AlertStatus) -> StoreResult<()> {
        let mut t = self.tables.write();
        let current = t.alerts.get(&alert.alert_id).ok_or_else(|| StoreError::Missing {
            entity: "alert",
            id: alert.alert_id.clone(),
        })?;
        if current.status != expected {
            return Err(StoreError::StatusMismatch {
                entity: "alert",
                id: alert.alert_id.clone(),
                expected: expected.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }
        t.alerts.insert(alert.alert_id.clone(), alert);
        Ok(())
    }

    fn list_alerts(&self) -> StoreResult<Vec<Alert>> {
        let t = self.tables.read();
        Ok(t.alert_order
            .iter()
            .filter_map(|id| t.alerts.get(id))
            .cloned()
            .collect())
    }
}
