//! Decision Recorder — admission-controlled capture of human and AI judgments.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{LedgerError, LedgerResult};
use crate::graph::EdgeGraph;
use crate::hash_chain::hash_record;
use crate::ingest::{EventIngestor, NewEvent};
use crate::linkage::record_gap;
use crate::store::EvidenceStore;
use crate::types::{Artifact, Decision, EdgeType, Event, LinkageStep, NodeRef, NodeType};

/// Minimum number of non-whitespace characters in a justification.
pub const MIN_JUSTIFICATION_CHARS: usize = 10;

/// Source system of the derived `DECISION.<TYPE>` events.
pub const DECISION_SOURCE: &str = "decision-recorder";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDecision {
    pub decision_type: String,
    pub outcome: String,
    #[serde(default)]
    pub justification: Option<String>,
    pub actor_id: String,
    pub related_event_id: String,
    #[serde(default)]
    pub ai_assisted: bool,
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub human_verified: bool,
    /// Persist the signed decision record as an artifact.
    #[serde(default)]
    pub create_artifact: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionReceipt {
    pub decision_id: String,
    pub payload_hash: String,
    pub edges_created: Vec<String>,
    pub artifact_id: Option<String>,
    /// The derived `DECISION.<TYPE>` event, when it could be emitted.
    pub event_id: Option<String>,
    pub linkage_gaps: Vec<String>,
}

/// Non-whitespace character count.
fn meaningful_len(s: &str) -> usize {
    s.chars().filter(|c| !c.is_whitespace()).count()
}

fn validate(req: &NewDecision) -> LedgerResult<String> {
    let justification = req.justification.as_deref().unwrap_or_default().trim();
    if meaningful_len(justification) < MIN_JUSTIFICATION_CHARS {
        return Err(LedgerError::Validation(format!(
            "justification must contain at least {MIN_JUSTIFICATION_CHARS} meaningful characters"
        )));
    }
    if req.decision_type.trim().is_empty() {
        return Err(LedgerError::Validation("decisionType is required".to_string()));
    }
    if req.actor_id.trim().is_empty() {
        return Err(LedgerError::Validation("actorId is required".to_string()));
    }
    if let Some(conf) = req.ai_confidence {
        if !(0.0..=1.0).contains(&conf) {
            return Err(LedgerError::Validation(format!(
                "aiConfidence {conf} is outside [0, 1]"
            )));
        }
    }
    Ok(justification.to_string())
}

fn decision_artifact(decision: &Decision) -> Artifact {
    Artifact {
        artifact_id: uuid::Uuid::new_v4().to_string(),
        artifact_type: "DECISION_RECORD".to_string(),
        hash: decision.payload_hash.clone(),
        hash_algorithm: "SHA-256".to_string(),
        storage_ref: format!("ledger://decisions/{}", decision.decision_id),
        storage_type: "LEDGER".to_string(),
        created_at: decision.created_at,
    }
}

/// Derived event: no clock triggers, so a decision can never start another
/// round of deadlines.
fn derived_event(decision: &Decision, trigger: &Event) -> NewEvent {
    let mut derived = NewEvent::new(
        format!("DECISION.{}", decision.decision_type),
        DECISION_SOURCE,
        json!({
            "decisionId": decision.decision_id,
            "decisionType": decision.decision_type,
            "outcome": decision.outcome,
            "actorId": decision.actor_id,
            "aiAssisted": decision.ai_assisted,
            "humanVerified": decision.human_verified,
            "payloadHash": decision.payload_hash,
        }),
    );
    derived.correlation_id = Some(trigger.correlation_id.clone());
    derived.causation_id = Some(trigger.event_id.clone());
    derived.regulatory_tags = Some(trigger.regulatory_tags.clone());
    derived.auto_trigger_clocks = false;
    derived.request_tsa_timestamp = Some(false);
    derived
}

pub struct DecisionRecorder {
    store: Arc<dyn EvidenceStore>,
    graph: Arc<EdgeGraph>,
    ingestor: Arc<EventIngestor>,
}

impl DecisionRecorder {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        graph: Arc<EdgeGraph>,
        ingestor: Arc<EventIngestor>,
    ) -> Self {
        Self {
            store,
            graph,
            ingestor,
        }
    }

    pub fn get_decision(&self, decision_id: &str) -> LedgerResult<Decision> {
        self.store
            .get_decision(decision_id)?
            .ok_or_else(|| LedgerError::not_found("decision", decision_id))
    }

    pub async fn create_decision(&self, req: NewDecision) -> LedgerResult<DecisionReceipt> {
        let justification = validate(&req)?;
        let trigger = self.ingestor.get_event(&req.related_event_id)?;

        let decision_type = req.decision_type.trim().to_ascii_uppercase();
        let decision_id = uuid::Uuid::new_v4().to_string();
        let actor_id = req.actor_id.trim().to_string();
        let created_at = Utc::now();
        let payload_hash = hash_record(&json!({
            "decisionId": decision_id,
            "decisionType": decision_type,
            "outcome": req.outcome,
            "justification": justification,
            "actorId": actor_id,
            "relatedEventId": trigger.event_id,
            "aiAssisted": req.ai_assisted,
            "aiConfidence": req.ai_confidence,
            "humanVerified": req.human_verified,
            "createdAt": created_at,
        }))?;
        let decision = Decision {
            decision_id,
            decision_type,
            outcome: req.outcome.clone(),
            justification,
            actor_id,
            related_event_id: trigger.event_id.clone(),
            ai_assisted: req.ai_assisted,
            ai_confidence: req.ai_confidence,
            human_verified: req.human_verified,
            payload_hash,
            created_at,
        };
        self.store.insert_decision(decision.clone())?;
        tracing::info!(
            "decision {} {} by {} on event {}",
            decision.decision_id,
            decision.decision_type,
            decision.actor_id,
            decision.related_event_id
        );

        let mut receipt = DecisionReceipt {
            decision_id: decision.decision_id.clone(),
            payload_hash: decision.payload_hash.0.clone(),
            edges_created: Vec::new(),
            artifact_id: None,
            event_id: None,
            linkage_gaps: Vec::new(),
        };
        let node = NodeRef::new(NodeType::Decision, decision.decision_id.clone());

        self.link(
            &mut receipt,
            &trigger.event_id,
            EdgeType::MadeBy,
            node.clone(),
            NodeRef::new(NodeType::Actor, decision.actor_id.clone()),
        );
        self.link(
            &mut receipt,
            &trigger.event_id,
            EdgeType::LeadsTo,
            NodeRef::new(NodeType::Event, trigger.event_id.clone()),
            node,
        );

        if req.create_artifact {
            match self.attach_artifact(&decision, &trigger.event_id, &mut receipt) {
                Ok(artifact_id) => receipt.artifact_id = Some(artifact_id),
                Err(e) => {
                    let step = LinkageStep::DecisionArtifact {
                        decision_id: decision.decision_id.clone(),
                    };
                    if let Some(gap) = record_gap(self.store.as_ref(), &trigger.event_id, step, &e) {
                        receipt.linkage_gaps.push(gap);
                    }
                }
            }
        }

        match self.ingestor.create_event(derived_event(&decision, &trigger)).await {
            Ok(ev) => {
                receipt.event_id = Some(ev.event_id);
                receipt.linkage_gaps.extend(ev.linkage_gaps);
            }
            Err(e) => {
                let step = LinkageStep::DecisionEvent {
                    decision_id: decision.decision_id.clone(),
                };
                if let Some(gap) = record_gap(self.store.as_ref(), &trigger.event_id, step, &e) {
                    receipt.linkage_gaps.push(gap);
                }
            }
        }

        Ok(receipt)
    }

    /// Store the record artifact and link it with PRODUCES. A failed edge
    /// becomes its own gap; the artifact id is returned either way.
    fn attach_artifact(
        &self,
        decision: &Decision,
        event_id: &str,
        receipt: &mut DecisionReceipt,
    ) -> LedgerResult<String> {
        let artifact = decision_artifact(decision);
        self.store.insert_artifact(artifact.clone())?;
        self.link(
            receipt,
            event_id,
            EdgeType::Produces,
            NodeRef::new(NodeType::Decision, decision.decision_id.clone()),
            NodeRef::new(NodeType::Artifact, artifact.artifact_id.clone()),
        );
        Ok(artifact.artifact_id)
    }

    pub(crate) fn repair_artifact(&self, decision_id: &str, event_id: &str) -> LedgerResult<String> {
        let decision = self.get_decision(decision_id)?;
        let mut scratch = DecisionReceipt {
            decision_id: decision.decision_id.clone(),
            payload_hash: decision.payload_hash.0.clone(),
            edges_created: Vec::new(),
            artifact_id: None,
            event_id: None,
            linkage_gaps: Vec::new(),
        };
        self.attach_artifact(&decision, event_id, &mut scratch)
    }

    pub(crate) async fn repair_event(&self, decision_id: &str) -> LedgerResult<String> {
        let decision = self.get_decision(decision_id)?;
        let trigger = self.ingestor.get_event(&decision.related_event_id)?;
        let receipt = self
            .ingestor
            .create_event(derived_event(&decision, &trigger))
            .await?;
        Ok(receipt.event_id)
    }

    fn link(
        &self,
        receipt: &mut DecisionReceipt,
        event_id: &str,
        edge_type: EdgeType,
        source: NodeRef,
        target: NodeRef,
    ) {
        match self
            .graph
            .create_edge(edge_type, source.clone(), target.clone(), None)
        {
            Ok(edge) => receipt.edges_created.push(edge.edge_id),
            Err(e) => {
                let step = LinkageStep::CreateEdge {
                    edge_type,
                    source,
                    target,
                    metadata: None,
                };
                if let Some(gap) = record_gap(self.store.as_ref(), event_id, step, &e) {
                    receipt.linkage_gaps.push(gap);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(justification: Option<&str>) -> NewDecision {
        NewDecision {
            decision_type: "credit_denial".to_string(),
            outcome: "DENIED".to_string(),
            justification: justification.map(str::to_string),
            actor_id: "officer-7".to_string(),
            related_event_id: "evt-1".to_string(),
            ai_assisted: true,
            ai_confidence: Some(0.82),
            human_verified: true,
            create_artifact: false,
        }
    }

    #[test]
    fn test_short_justification_rejected() {
        assert!(validate(&request(Some("ok"))).is_err());
        assert!(validate(&request(None)).is_err());
        // Whitespace does not count toward the minimum.
        assert!(validate(&request(Some("a b c d e f g h i"))).is_err());
        assert!(validate(&request(Some("ten chars!"))).is_ok());
    }

    #[test]
    fn test_confidence_bounds() {
        let mut req = request(Some("model output reviewed by officer"));
        req.ai_confidence = Some(1.4);
        assert!(matches!(validate(&req), Err(LedgerError::Validation(_))));
    }
}
