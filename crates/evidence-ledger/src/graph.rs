//! Edge Graph Builder — the sole writer of evidence-graph edges.
//!
//! Edges are append-only. There is no update or delete; a correction is a new
//! edge (usually `SUPERSEDES`). The graph accepts whatever ids it is given and
//! leaves referential correctness to the caller.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::error::LedgerResult;
use crate::store::EvidenceStore;
use crate::types::{Edge, EdgeType, NodeRef};

pub struct EdgeGraph {
    store: Arc<dyn EvidenceStore>,
}

impl EdgeGraph {
    pub fn new(store: Arc<dyn EvidenceStore>) -> Self {
        Self { store }
    }

    /// Create an immutable edge `source -[edge_type]-> target`.
    pub fn create_edge(
        &self,
        edge_type: EdgeType,
        source: NodeRef,
        target: NodeRef,
        metadata: Option<Value>,
    ) -> LedgerResult<Edge> {
        let edge = Edge {
            edge_id: uuid::Uuid::new_v4().to_string(),
            edge_type,
            source_node_type: source.node_type,
            source_node_id: source.node_id,
            target_node_type: target.node_type,
            target_node_id: target.node_id,
            metadata,
            created_at: Utc::now(),
        };
        self.store.insert_edge(edge.clone())?;
        tracing::debug!(
            "edge {} {:?}:{} -> {:?}:{}",
            edge.edge_type.as_str(),
            edge.source_node_type,
            edge.source_node_id,
            edge.target_node_type,
            edge.target_node_id
        );
        Ok(edge)
    }

    pub fn edges_from(&self, node: &NodeRef) -> LedgerResult<Vec<Edge>> {
        Ok(self.store.edges_from(node)?)
    }

    pub fn edges_to(&self, node: &NodeRef) -> LedgerResult<Vec<Edge>> {
        Ok(self.store.edges_to(node)?)
    }

    /// Outgoing edges of one type.
    pub fn outgoing(&self, node: &NodeRef, edge_type: EdgeType) -> LedgerResult<Vec<Edge>> {
        Ok(self
            .edges_from(node)?
            .into_iter()
            .filter(|e| e.edge_type == edge_type)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::NodeType;
    use serde_json::json;

    #[test]
    fn test_create_and_query_edges() {
        let graph = EdgeGraph::new(Arc::new(InMemoryStore::new()));
        let decision = NodeRef::new(NodeType::Decision, "d1");
        let actor = NodeRef::new(NodeType::Actor, "alice");

        let edge = graph
            .create_edge(
                EdgeType::MadeBy,
                decision.clone(),
                actor.clone(),
                Some(json!({ "role": "credit_officer" })),
            )
            .unwrap();

        assert_eq!(edge.source(), decision);
        assert_eq!(graph.edges_from(&decision).unwrap().len(), 1);
        assert_eq!(graph.edges_to(&actor).unwrap().len(), 1);
        assert!(graph.outgoing(&decision, EdgeType::LeadsTo).unwrap().is_empty());
    }

    #[test]
    fn test_correction_is_a_new_edge() {
        let graph = EdgeGraph::new(Arc::new(InMemoryStore::new()));
        let wrong = NodeRef::new(NodeType::Artifact, "a-wrong");
        let right = NodeRef::new(NodeType::Artifact, "a-right");
        let clock = NodeRef::new(NodeType::Clock, "c1");

        let original = graph
            .create_edge(EdgeType::FulfilledBy, clock.clone(), wrong, None)
            .unwrap();
        graph
            .create_edge(EdgeType::FulfilledBy, clock.clone(), right, None)
            .unwrap();
        graph
            .create_edge(
                EdgeType::Supersedes,
                clock.clone(),
                clock.clone(),
                Some(json!({ "supersededEdge": original.edge_id })),
            )
            .unwrap();

        // The original edge is still there.
        let fulfilled = graph.outgoing(&clock, EdgeType::FulfilledBy).unwrap();
        assert_eq!(fulfilled.len(), 2);
    }
}
