//! Core data types for the evidence graph: events, decisions, clocks, edges,
//! artifacts, alerts, and timestamps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::ClockType;

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Sentinel used as `previous_hash` for the first event of a source.
    pub fn genesis() -> Self {
        Self(GENESIS_HASH.to_string())
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == GENESIS_HASH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 64 lowercase hex characters.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Regulation codes an event or clock may cite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Regulation {
    #[serde(rename = "GDPR")]
    Gdpr,
    #[serde(rename = "DORA")]
    Dora,
    #[serde(rename = "NIS2")]
    Nis2,
    #[serde(rename = "AI_ACT")]
    AiAct,
    #[serde(rename = "INTERNAL")]
    Internal,
}

impl Regulation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gdpr => "GDPR",
            Self::Dora => "DORA",
            Self::Nis2 => "NIS2",
            Self::AiAct => "AI_ACT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl FromStr for Regulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "GDPR" => Ok(Self::Gdpr),
            "DORA" => Ok(Self::Dora),
            "NIS2" => Ok(Self::Nis2),
            "AI_ACT" | "AIACT" => Ok(Self::AiAct),
            "INTERNAL" => Ok(Self::Internal),
            other => Err(format!("unknown regulation: {other}")),
        }
    }
}

/// An immutable, hash-chained fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub sequence_number: u64,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub source_system: String,
    pub regulatory_tags: Vec<Regulation>,
    pub articles: Vec<String>,
    pub payload: Value,
    pub payload_hash: ContentHash,
    pub previous_hash: ContentHash,
}

/// A human or AI judgment tied to one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub decision_id: String,
    pub decision_type: String,
    pub outcome: String,
    pub justification: String,
    pub actor_id: String,
    pub related_event_id: String,
    pub ai_assisted: bool,
    pub ai_confidence: Option<f64>,
    pub human_verified: bool,
    pub payload_hash: ContentHash,
    pub created_at: DateTime<Utc>,
}

/// Clock lifecycle. RUNNING is initial; the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockStatus {
    Running,
    Met,
    Breached,
    Stopped,
}

impl ClockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Met => "MET",
            Self::Breached => "BREACHED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A regulatory or internal countdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clock {
    pub clock_id: String,
    pub clock_type: ClockType,
    pub regulation: Regulation,
    pub article: String,
    pub start_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: ClockStatus,
    pub related_event_id: String,
    pub correlation_id: String,
    pub evidence_artifact_id: Option<String>,
    pub stop_reason: Option<String>,
    pub met_at: Option<DateTime<Utc>>,
    pub breached_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

/// Node kinds in the evidence graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Event,
    Decision,
    Clock,
    Artifact,
    Actor,
    Control,
    Alert,
}

/// Directed relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    MadeBy,
    LeadsTo,
    Produces,
    Triggers,
    FulfilledBy,
    EvaluatedBy,
    DocumentedBy,
    Supersedes,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MadeBy => "MADE_BY",
            Self::LeadsTo => "LEADS_TO",
            Self::Produces => "PRODUCES",
            Self::Triggers => "TRIGGERS",
            Self::FulfilledBy => "FULFILLED_BY",
            Self::EvaluatedBy => "EVALUATED_BY",
            Self::DocumentedBy => "DOCUMENTED_BY",
            Self::Supersedes => "SUPERSEDES",
        }
    }
}

/// A typed reference to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub node_type: NodeType,
    pub node_id: String,
}

impl NodeRef {
    pub fn new(node_type: NodeType, node_id: impl Into<String>) -> Self {
        Self {
            node_type,
            node_id: node_id.into(),
        }
    }
}

/// A directed, typed, immutable relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub edge_type: EdgeType,
    pub source_node_type: NodeType,
    pub source_node_id: String,
    pub target_node_type: NodeType,
    pub target_node_id: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn source(&self) -> NodeRef {
        NodeRef::new(self.source_node_type, self.source_node_id.clone())
    }

    pub fn target(&self) -> NodeRef {
        NodeRef::new(self.target_node_type, self.target_node_id.clone())
    }
}

/// A durable, hash-identified evidentiary object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_type: String,
    pub hash: ContentHash,
    pub hash_algorithm: String,
    pub storage_ref: String,
    pub storage_type: String,
    pub created_at: DateTime<Utc>,
}

/// Alert severity. Ordering follows the escalation ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Breach,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Breach => "BREACH",
        }
    }

    /// One step up the ratchet, capped at BREACH.
    pub fn escalated(self) -> Self {
        match self {
            Self::Info => Self::Warning,
            Self::Warning => Self::Critical,
            Self::Critical | Self::Breach => Self::Breach,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Escalated,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Resolved => "RESOLVED",
            Self::Escalated => "ESCALATED",
        }
    }

    /// ACTIVE and ESCALATED alerts still need someone to act.
    pub fn requires_action(self) -> bool {
        matches!(self, Self::Active | Self::Escalated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCategory {
    Deadline,
    Incident,
    Breach,
    AiGovernance,
    Control,
    System,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deadline => "DEADLINE",
            Self::Incident => "INCIDENT",
            Self::Breach => "BREACH",
            Self::AiGovernance => "AI_GOVERNANCE",
            Self::Control => "CONTROL",
            Self::System => "SYSTEM",
        }
    }

    /// Roles responsible for an alert of this category unless overridden.
    pub fn default_roles(self) -> Vec<String> {
        let roles: &[&str] = match self {
            Self::Deadline => &["compliance_officer"],
            Self::Incident => &["incident_manager", "ciso"],
            Self::Breach => &["dpo", "ciso"],
            Self::AiGovernance => &["ai_governance_lead"],
            Self::Control => &["control_owner"],
            Self::System => &["platform_admin"],
        };
        roles.iter().map(|r| r.to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Dashboard,
    Email,
    Slack,
    Webhook,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
        }
    }

    /// Channels an alert of the given severity fans out to by default.
    pub fn defaults_for(severity: AlertSeverity) -> Vec<Channel> {
        match severity {
            AlertSeverity::Breach => vec![Self::Dashboard, Self::Email, Self::Slack],
            AlertSeverity::Critical => vec![Self::Dashboard, Self::Email],
            AlertSeverity::Info | AlertSeverity::Warning => vec![Self::Dashboard],
        }
    }
}

/// Where an alert record lives. `LocalCache` records are non-authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStorage {
    Primary,
    LocalCache,
}

/// An actionable notification derived from clocks or events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub source_type: NodeType,
    pub source_id: String,
    pub correlation_id: Option<String>,
    pub assigned_roles: Vec<String>,
    pub channels: Vec<Channel>,
    pub escalation_level: u32,
    pub details: BTreeMap<String, String>,
    pub storage: AlertStorage,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalated_to: Vec<String>,
}

/// Proof that a hash existed at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsaTimestamp {
    pub timestamp_id: String,
    pub subject: TimestampSubject,
    pub tsa_response: String,
    pub tsa_time: DateTime<Utc>,
    pub tsa_provider: String,
    pub hash_timestamped: ContentHash,
}

/// What a timestamp was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TimestampSubject {
    Event(String),
    Anchor(String),
}

/// A secondary step that failed after its event was already durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkageGap {
    pub gap_id: String,
    pub event_id: String,
    pub step: LinkageStep,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
    pub attempts: u32,
    /// Set while a retry holds the gap.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Enough data to re-run a failed secondary step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkageStep {
    TriggerClock {
        clock_type: ClockType,
        start_time: DateTime<Utc>,
    },
    CreateEdge {
        edge_type: EdgeType,
        source: NodeRef,
        target: NodeRef,
        #[serde(default)]
        metadata: Option<Value>,
    },
    Timestamp {
        hash: ContentHash,
    },
    /// Record artifact (and its PRODUCES edge) of a decision.
    DecisionArtifact {
        decision_id: String,
    },
    /// Derived `DECISION.<TYPE>` event of a decision.
    DecisionEvent {
        decision_id: String,
    },
}
