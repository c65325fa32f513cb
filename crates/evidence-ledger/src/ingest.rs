//! Event Ingestion Orchestrator — the only path by which events are created.
//!
//! Chaining is mandatory and atomic. Everything after it (clock triggers,
//! related edges, timestamping) is secondary: a failure there is logged,
//! recorded as a [`LinkageGap`](crate::types::LinkageGap), and leaves the
//! event in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::clock::{clocks_triggered_by, ClockEngine, NewClock};
use crate::error::{LedgerError, LedgerResult};
use crate::graph::EdgeGraph;
use crate::hash_chain::{compute_hash, HashChainAuthority};
use crate::linkage::record_gap;
use crate::store::EvidenceStore;
use crate::tsa::TimestampClient;
use crate::types::{
    Clock, EdgeType, Event, LinkageGap, LinkageStep, NodeRef, NodeType, Regulation, Severity,
};

/// Source system of `CLOCK.<STATUS>` events.
pub const CLOCK_SOURCE: &str = "clock-engine";

fn default_true() -> bool {
    true
}

/// Request to record one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub event_type: String,
    pub source_system: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub regulatory_tags: Option<Vec<Regulation>>,
    #[serde(default)]
    pub articles: Option<Vec<String>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub auto_trigger_clocks: bool,
    #[serde(default = "default_true")]
    pub auto_create_edges: bool,
    /// `None` lets CRITICAL events be stamped; `Some(false)` opts out.
    #[serde(default)]
    pub request_tsa_timestamp: Option<bool>,
    #[serde(default)]
    pub related_decision_id: Option<String>,
    #[serde(default)]
    pub related_control_id: Option<String>,
    #[serde(default)]
    pub related_actor_id: Option<String>,
    #[serde(default)]
    pub related_artifact_id: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, source_system: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source_system: source_system.into(),
            payload,
            severity: None,
            regulatory_tags: None,
            articles: None,
            correlation_id: None,
            causation_id: None,
            occurred_at: None,
            auto_trigger_clocks: true,
            auto_create_edges: true,
            request_tsa_timestamp: None,
            related_decision_id: None,
            related_control_id: None,
            related_actor_id: None,
            related_artifact_id: None,
        }
    }
}

/// What [`EventIngestor::create_event`] did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReceipt {
    pub event_id: String,
    pub sequence_number: u64,
    pub severity: Severity,
    pub clocks_created: Vec<String>,
    pub edges_created: Vec<String>,
    pub tsa_timestamp_id: Option<String>,
    /// Secondary steps that failed and are queued for repair.
    pub linkage_gaps: Vec<String>,
    /// Alert raised for this event by the ledger's ingestion rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
}

/// Keyword heuristic over the event type and top-level payload strings.
pub fn infer_severity(event_type: &str, payload: &Value) -> Severity {
    let mut haystack = event_type.to_ascii_uppercase();
    if let Value::Object(map) = payload {
        for v in map.values() {
            if let Value::String(s) = v {
                haystack.push(' ');
                haystack.push_str(&s.to_ascii_uppercase());
            }
        }
    }

    let has = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));
    if has(&["BREACH", "BLOCKED"]) {
        Severity::Critical
    } else if has(&["ESCALATED", "FAILED"]) {
        Severity::High
    } else if has(&["WARNING", "OVERRIDE"]) {
        Severity::Medium
    } else {
        Severity::Info
    }
}

/// Regulations an event type is tagged with, if the table knows it.
pub fn regulations_for(event_type: &str) -> Option<Vec<Regulation>> {
    let family = event_type.split('.').next().unwrap_or_default();
    let tags = match family {
        "INCIDENT" => vec![Regulation::Dora, Regulation::Nis2],
        "BREACH" | "DSAR" | "CONSENT" => vec![Regulation::Gdpr],
        "AI" => vec![Regulation::AiAct],
        "ICT" | "THIRD_PARTY" => vec![Regulation::Dora],
        "VULNERABILITY" => vec![Regulation::Nis2],
        _ => return None,
    };
    Some(tags)
}

pub struct EventIngestor {
    store: Arc<dyn EvidenceStore>,
    chain: Arc<HashChainAuthority>,
    clocks: Arc<ClockEngine>,
    graph: Arc<EdgeGraph>,
    tsa: Arc<TimestampClient>,
    fallback_regulation: Regulation,
}

impl EventIngestor {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        chain: Arc<HashChainAuthority>,
        clocks: Arc<ClockEngine>,
        graph: Arc<EdgeGraph>,
        tsa: Arc<TimestampClient>,
        fallback_regulation: Regulation,
    ) -> Self {
        Self {
            store,
            chain,
            clocks,
            graph,
            tsa,
            fallback_regulation,
        }
    }

    pub fn store(&self) -> &Arc<dyn EvidenceStore> {
        &self.store
    }

    pub fn get_event(&self, event_id: &str) -> LedgerResult<Event> {
        self.store
            .get_event(event_id)?
            .ok_or_else(|| LedgerError::not_found("event", event_id))
    }

    /// Record an event and run its secondary linkage.
    pub async fn create_event(&self, req: NewEvent) -> LedgerResult<EventReceipt> {
        let event_type = req.event_type.trim().to_string();
        let source_system = req.source_system.trim().to_string();
        if event_type.is_empty() {
            return Err(LedgerError::Validation("eventType is required".to_string()));
        }
        if source_system.is_empty() {
            return Err(LedgerError::Validation("sourceSystem is required".to_string()));
        }

        let severity = req
            .severity
            .unwrap_or_else(|| infer_severity(&event_type, &req.payload));
        let regulatory_tags = match req.regulatory_tags.clone() {
            Some(tags) if !tags.is_empty() => tags,
            _ => regulations_for(&event_type).unwrap_or_else(|| vec![self.fallback_regulation]),
        };
        let payload_hash = compute_hash(&req.payload);
        let event_id = uuid::Uuid::new_v4().to_string();
        let correlation_id = req.correlation_id.clone().unwrap_or_else(|| event_id.clone());
        let now = Utc::now();
        let occurred_at = req.occurred_at.unwrap_or(now);

        let event = self
            .chain
            .append(&source_system, |link| Event {
                event_id: event_id.clone(),
                correlation_id,
                causation_id: req.causation_id.clone(),
                sequence_number: link.sequence,
                occurred_at,
                recorded_at: now,
                event_type: event_type.clone(),
                severity,
                source_system: source_system.clone(),
                regulatory_tags,
                articles: req.articles.clone().unwrap_or_default(),
                payload: req.payload.clone(),
                payload_hash,
                previous_hash: link.previous_hash,
            })
            .await?;
        tracing::info!(
            "event {} {} #{} from '{}' ({})",
            event.event_id,
            event.event_type,
            event.sequence_number,
            event.source_system,
            event.severity.as_str()
        );

        let mut receipt = EventReceipt {
            event_id: event.event_id.clone(),
            sequence_number: event.sequence_number,
            severity: event.severity,
            clocks_created: Vec::new(),
            edges_created: Vec::new(),
            tsa_timestamp_id: None,
            linkage_gaps: Vec::new(),
            alert_id: None,
        };

        if req.auto_trigger_clocks {
            for &clock_type in clocks_triggered_by(&event.event_type) {
                let step = LinkageStep::TriggerClock {
                    clock_type,
                    start_time: event.occurred_at,
                };
                let outcome = self.run_step(&event, &step).await;
                match outcome {
                    Ok(id) => receipt.clocks_created.push(id),
                    Err(e) => self.gap(&mut receipt, &event, step, &e),
                }
            }
        }

        if req.auto_create_edges {
            for step in related_edges(&event.event_id, &req) {
                let outcome = self.run_step(&event, &step).await;
                match outcome {
                    Ok(id) => receipt.edges_created.push(id),
                    Err(e) => self.gap(&mut receipt, &event, step, &e),
                }
            }
        }

        let stamp = req
            .request_tsa_timestamp
            .unwrap_or(event.severity == Severity::Critical);
        if stamp {
            let step = LinkageStep::Timestamp {
                hash: event.payload_hash.clone(),
            };
            let outcome = self.run_step(&event, &step).await;
            match outcome {
                Ok(id) => receipt.tsa_timestamp_id = Some(id),
                Err(e) => self.gap(&mut receipt, &event, step, &e),
            }
        }

        Ok(receipt)
    }

    fn gap(&self, receipt: &mut EventReceipt, event: &Event, step: LinkageStep, e: &LedgerError) {
        if let Some(gap_id) = record_gap(self.store.as_ref(), &event.event_id, step, e) {
            receipt.linkage_gaps.push(gap_id);
        }
    }

    /// Execute one secondary step for `event`, returning the id it produced.
    async fn run_step(&self, event: &Event, step: &LinkageStep) -> LedgerResult<String> {
        match step {
            LinkageStep::TriggerClock {
                clock_type,
                start_time,
            } => {
                let clock = self.clocks.create_clock(NewClock {
                    clock_type: *clock_type,
                    start_time: *start_time,
                    deadline_override: None,
                    related_event_id: event.event_id.clone(),
                    correlation_id: event.correlation_id.clone(),
                })?;
                Ok(clock.clock_id)
            }
            LinkageStep::CreateEdge {
                edge_type,
                source,
                target,
                metadata,
            } => {
                let edge = self.graph.create_edge(
                    *edge_type,
                    source.clone(),
                    target.clone(),
                    metadata.clone(),
                )?;
                Ok(edge.edge_id)
            }
            LinkageStep::Timestamp { hash } => {
                let stamp = self.tsa.timestamp_event(&event.event_id, hash).await?;
                Ok(stamp.timestamp_id)
            }
            LinkageStep::DecisionArtifact { decision_id }
            | LinkageStep::DecisionEvent { decision_id } => Err(LedgerError::Validation(format!(
                "step for decision {decision_id} is repaired by the decision recorder"
            ))),
        }
    }

    /// Re-run an event's secondary step. The caller holds the gap's claim.
    pub(crate) async fn repair(&self, event_id: &str, step: &LinkageStep) -> LedgerResult<String> {
        let event = self.get_event(event_id)?;
        self.run_step(&event, step).await
    }

    /// Emit the `CLOCK.<STATUS>` event for a clock that just changed status.
    pub async fn record_clock_status(&self, clock: &Clock) -> LedgerResult<EventReceipt> {
        let mut req = NewEvent::new(
            format!("CLOCK.{}", clock.status.as_str()),
            CLOCK_SOURCE,
            json!({
                "clockId": clock.clock_id,
                "clockType": clock.clock_type,
                "status": clock.status,
                "deadline": clock.deadline,
                "metAt": clock.met_at,
                "breachedAt": clock.breached_at,
                "stoppedAt": clock.stopped_at,
                "stopReason": clock.stop_reason,
                "evidenceArtifactId": clock.evidence_artifact_id,
                "updatedBy": clock.updated_by,
            }),
        );
        req.correlation_id = Some(clock.correlation_id.clone());
        req.causation_id = Some(clock.related_event_id.clone());
        req.regulatory_tags = Some(vec![clock.regulation]);
        req.articles = Some(vec![clock.article.clone()]);
        req.auto_trigger_clocks = false;
        req.related_artifact_id = clock.evidence_artifact_id.clone();
        self.create_event(req).await
    }

    pub fn open_linkage_gaps(&self) -> LedgerResult<Vec<LinkageGap>> {
        Ok(self.store.open_linkage_gaps()?)
    }
}

fn related_edges(event_id: &str, req: &NewEvent) -> Vec<LinkageStep> {
    let event = || NodeRef::new(NodeType::Event, event_id);
    let mut steps = Vec::new();
    if let Some(id) = &req.related_decision_id {
        steps.push(LinkageStep::CreateEdge {
            edge_type: EdgeType::LeadsTo,
            source: NodeRef::new(NodeType::Decision, id.clone()),
            target: event(),
            metadata: None,
        });
    }
    if let Some(id) = &req.related_control_id {
        steps.push(LinkageStep::CreateEdge {
            edge_type: EdgeType::EvaluatedBy,
            source: event(),
            target: NodeRef::new(NodeType::Control, id.clone()),
            metadata: None,
        });
    }
    if let Some(id) = &req.related_actor_id {
        steps.push(LinkageStep::CreateEdge {
            edge_type: EdgeType::MadeBy,
            source: event(),
            target: NodeRef::new(NodeType::Actor, id.clone()),
            metadata: None,
        });
    }
    if let Some(id) = &req.related_artifact_id {
        steps.push(LinkageStep::CreateEdge {
            edge_type: EdgeType::DocumentedBy,
            source: event(),
            target: NodeRef::new(NodeType::Artifact, id.clone()),
            metadata: None,
        });
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_heuristics() {
        assert_eq!(infer_severity("BREACH.DETECTED", &json!({})), Severity::Critical);
        assert_eq!(infer_severity("AI.PROMPT.BLOCKED", &json!({})), Severity::Critical);
        assert_eq!(infer_severity("INCIDENT.ESCALATED", &json!({})), Severity::High);
        assert_eq!(infer_severity("BACKUP.FAILED", &json!({})), Severity::High);
        assert_eq!(infer_severity("MODEL.OVERRIDE", &json!({})), Severity::Medium);
        assert_eq!(infer_severity("INCIDENT.CREATED", &json!({})), Severity::Info);
    }

    #[test]
    fn test_severity_reads_payload_strings() {
        let payload = json!({ "status": "blocked", "count": 3 });
        assert_eq!(infer_severity("AI.REQUEST", &payload), Severity::Critical);
    }

    #[test]
    fn test_regulation_table() {
        assert_eq!(
            regulations_for("INCIDENT.CREATED"),
            Some(vec![Regulation::Dora, Regulation::Nis2])
        );
        assert_eq!(regulations_for("BREACH.DETECTED"), Some(vec![Regulation::Gdpr]));
        assert_eq!(regulations_for("AI.INCIDENT.SERIOUS"), Some(vec![Regulation::AiAct]));
        assert_eq!(regulations_for("DECISION.APPROVAL"), None);
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: NewEvent = serde_json::from_value(json!({
            "eventType": "INCIDENT.CREATED",
            "sourceSystem": "incident-mgmt"
        }))
        .unwrap();
        assert!(req.auto_trigger_clocks);
        assert!(req.auto_create_edges);
        assert_eq!(req.request_tsa_timestamp, None);
        assert_eq!(req.payload, Value::Null);
    }

    #[test]
    fn test_related_edge_directions() {
        let mut req = NewEvent::new("CONTROL.TESTED", "grc", json!({}));
        req.related_decision_id = Some("d1".to_string());
        req.related_control_id = Some("ctl-9".to_string());
        let steps = related_edges("e1", &req);
        assert_eq!(steps.len(), 2);
        match &steps[0] {
            LinkageStep::CreateEdge {
                edge_type, source, ..
            } => {
                assert_eq!(*edge_type, EdgeType::LeadsTo);
                assert_eq!(source.node_type, NodeType::Decision);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}
