//! Clock Engine — regulatory SLA catalogue, deadline derivation, lifecycle
//! transitions, and threshold evaluation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{LedgerError, LedgerResult};
use crate::graph::EdgeGraph;
use crate::linkage::record_gap;
use crate::store::EvidenceStore;
use crate::types::{
    AlertSeverity, Clock, ClockStatus, EdgeType, LinkageStep, NodeRef, NodeType, Regulation,
};

/// Every deadline the platform tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClockType {
    #[serde(rename = "DORA_4H_INITIAL")]
    DoraInitialNotification,
    #[serde(rename = "DORA_72H_INTERMEDIATE")]
    DoraIntermediateReport,
    #[serde(rename = "DORA_1M_FINAL")]
    DoraFinalReport,
    #[serde(rename = "NIS2_24H_WARNING")]
    Nis2EarlyWarning,
    #[serde(rename = "NIS2_72H_NOTIFICATION")]
    Nis2IncidentNotification,
    #[serde(rename = "NIS2_1M_FINAL")]
    Nis2FinalReport,
    #[serde(rename = "GDPR_72H_BREACH")]
    GdprBreachNotification,
    #[serde(rename = "GDPR_30D_DSAR")]
    GdprDataSubjectRequest,
    #[serde(rename = "AI_ACT_15D_SERIOUS")]
    AiActSeriousIncident,
    #[serde(rename = "AI_ACT_2D_WIDESPREAD")]
    AiActWidespreadIncident,
    #[serde(rename = "INTERNAL_1H_TRIAGE")]
    InternalTriage,
}

/// Regulation, article, and duration attached to a clock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSla {
    pub regulation: Regulation,
    pub article: &'static str,
    pub duration_hours: i64,
}

impl ClockType {
    pub const ALL: [ClockType; 11] = [
        ClockType::DoraInitialNotification,
        ClockType::DoraIntermediateReport,
        ClockType::DoraFinalReport,
        ClockType::Nis2EarlyWarning,
        ClockType::Nis2IncidentNotification,
        ClockType::Nis2FinalReport,
        ClockType::GdprBreachNotification,
        ClockType::GdprDataSubjectRequest,
        ClockType::AiActSeriousIncident,
        ClockType::AiActWidespreadIncident,
        ClockType::InternalTriage,
    ];

    pub fn sla(self) -> ClockSla {
        use Regulation::*;
        let (regulation, article, duration_hours) = match self {
            Self::DoraInitialNotification => (Dora, "Art. 19(4)(a)", 4),
            Self::DoraIntermediateReport => (Dora, "Art. 19(4)(b)", 72),
            Self::DoraFinalReport => (Dora, "Art. 19(4)(c)", 720),
            Self::Nis2EarlyWarning => (Nis2, "Art. 23(4)(a)", 24),
            Self::Nis2IncidentNotification => (Nis2, "Art. 23(4)(b)", 72),
            Self::Nis2FinalReport => (Nis2, "Art. 23(4)(d)", 720),
            Self::GdprBreachNotification => (Gdpr, "Art. 33(1)", 72),
            Self::GdprDataSubjectRequest => (Gdpr, "Art. 12(3)", 720),
            Self::AiActSeriousIncident => (AiAct, "Art. 73(2)", 360),
            Self::AiActWidespreadIncident => (AiAct, "Art. 73(3)", 48),
            Self::InternalTriage => (Internal, "Policy IR-1", 1),
        };
        ClockSla {
            regulation,
            article,
            duration_hours,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::hours(self.sla().duration_hours)
    }

    /// Wire code, e.g. `DORA_4H_INITIAL`.
    pub fn code(self) -> &'static str {
        match self {
            Self::DoraInitialNotification => "DORA_4H_INITIAL",
            Self::DoraIntermediateReport => "DORA_72H_INTERMEDIATE",
            Self::DoraFinalReport => "DORA_1M_FINAL",
            Self::Nis2EarlyWarning => "NIS2_24H_WARNING",
            Self::Nis2IncidentNotification => "NIS2_72H_NOTIFICATION",
            Self::Nis2FinalReport => "NIS2_1M_FINAL",
            Self::GdprBreachNotification => "GDPR_72H_BREACH",
            Self::GdprDataSubjectRequest => "GDPR_30D_DSAR",
            Self::AiActSeriousIncident => "AI_ACT_15D_SERIOUS",
            Self::AiActWidespreadIncident => "AI_ACT_2D_WIDESPREAD",
            Self::InternalTriage => "INTERNAL_1H_TRIAGE",
        }
    }
}

/// Clock types an event type starts automatically.
pub fn clocks_triggered_by(event_type: &str) -> &'static [ClockType] {
    match event_type {
        "INCIDENT.CREATED" => &[ClockType::DoraInitialNotification, ClockType::Nis2EarlyWarning],
        "INCIDENT.MAJOR_CLASSIFIED" => &[
            ClockType::DoraIntermediateReport,
            ClockType::Nis2IncidentNotification,
        ],
        "INCIDENT.RESOLVED" => &[ClockType::DoraFinalReport, ClockType::Nis2FinalReport],
        "INCIDENT.TRIAGE_REQUIRED" => &[ClockType::InternalTriage],
        "BREACH.DETECTED" => &[ClockType::GdprBreachNotification],
        "DSAR.RECEIVED" => &[ClockType::GdprDataSubjectRequest],
        "AI.INCIDENT.SERIOUS" => &[ClockType::AiActSeriousIncident],
        "AI.INCIDENT.WIDESPREAD" => &[ClockType::AiActWidespreadIncident],
        _ => &[],
    }
}

/// A named pre-deadline warning window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningThreshold {
    pub name: String,
    pub window_minutes: i64,
    pub severity: AlertSeverity,
}

impl WarningThreshold {
    pub fn new(name: &str, window: Duration, severity: AlertSeverity) -> Self {
        Self {
            name: name.to_string(),
            window_minutes: window.num_minutes(),
            severity,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::minutes(self.window_minutes)
    }

    pub fn defaults() -> Vec<WarningThreshold> {
        vec![
            Self::new("T-24h", Duration::hours(24), AlertSeverity::Warning),
            Self::new("T-4h", Duration::hours(4), AlertSeverity::Critical),
            Self::new("T-1h", Duration::hours(1), AlertSeverity::Critical),
        ]
    }
}

/// Dedupe key recorded once a clock has breached.
pub const BREACH_NOTICE: &str = "BREACHED";

/// Input for [`ClockEngine::create_clock`].
#[derive(Debug, Clone)]
pub struct NewClock {
    pub clock_type: ClockType,
    pub start_time: DateTime<Utc>,
    pub deadline_override: Option<DateTime<Utc>>,
    pub related_event_id: String,
    pub correlation_id: String,
}

/// Explicit status change requested by a human or system actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockUpdate {
    #[serde(rename_all = "camelCase")]
    Met {
        evidence_artifact_id: Option<String>,
        actor_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Stopped {
        reason: String,
        actor_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Breached { actor_id: Option<String> },
}

impl ClockUpdate {
    pub fn target_status(&self) -> ClockStatus {
        match self {
            Self::Met { .. } => ClockStatus::Met,
            Self::Stopped { .. } => ClockStatus::Stopped,
            Self::Breached { .. } => ClockStatus::Breached,
        }
    }
}

/// What a sweep found for one running clock.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockSignal {
    /// `now` is inside the tightest applicable warning window.
    Warning {
        clock: Clock,
        threshold: WarningThreshold,
        /// Looser windows that also apply and should be marked notified.
        superseded: Vec<String>,
    },
    /// `now` is at or past the deadline.
    Breach { clock: Clock },
}

pub struct ClockEngine {
    store: Arc<dyn EvidenceStore>,
    graph: Arc<EdgeGraph>,
}

impl ClockEngine {
    pub fn new(store: Arc<dyn EvidenceStore>, graph: Arc<EdgeGraph>) -> Self {
        Self { store, graph }
    }

    /// Persist a RUNNING clock and link it from its originating event.
    pub fn create_clock(&self, req: NewClock) -> LedgerResult<Clock> {
        let sla = req.clock_type.sla();
        let deadline = req
            .deadline_override
            .unwrap_or(req.start_time + req.clock_type.duration());
        if deadline <= req.start_time {
            return Err(LedgerError::Validation(format!(
                "deadline {deadline} is not after start {}",
                req.start_time
            )));
        }

        let clock = Clock {
            clock_id: uuid::Uuid::new_v4().to_string(),
            clock_type: req.clock_type,
            regulation: sla.regulation,
            article: sla.article.to_string(),
            start_time: req.start_time,
            deadline,
            status: ClockStatus::Running,
            related_event_id: req.related_event_id,
            correlation_id: req.correlation_id,
            evidence_artifact_id: None,
            stop_reason: None,
            met_at: None,
            breached_at: None,
            stopped_at: None,
            updated_by: None,
        };
        self.store.insert_clock(clock.clone())?;
        tracing::info!(
            "clock {} ({}) running until {}",
            clock.clock_id,
            clock.clock_type.code(),
            clock.deadline
        );

        let source = NodeRef::new(NodeType::Event, clock.related_event_id.clone());
        let target = NodeRef::new(NodeType::Clock, clock.clock_id.clone());
        let metadata = Some(json!({ "clockType": clock.clock_type.code() }));
        if let Err(e) = self.graph.create_edge(
            EdgeType::Triggers,
            source.clone(),
            target.clone(),
            metadata.clone(),
        ) {
            record_gap(
                self.store.as_ref(),
                &clock.related_event_id,
                LinkageStep::CreateEdge {
                    edge_type: EdgeType::Triggers,
                    source,
                    target,
                    metadata,
                },
                &e,
            );
        }
        Ok(clock)
    }

    pub fn get_clock(&self, clock_id: &str) -> LedgerResult<Clock> {
        self.store
            .get_clock(clock_id)?
            .ok_or_else(|| LedgerError::not_found("clock", clock_id))
    }

    pub fn running_clocks(&self) -> LedgerResult<Vec<Clock>> {
        Ok(self.store.clocks_with_status(ClockStatus::Running)?)
    }

    /// Move a RUNNING clock to a terminal status. First writer wins: a clock
    /// that is no longer RUNNING rejects the update with `ConcurrencyLoss`.
    pub fn transition(
        &self,
        clock_id: &str,
        update: ClockUpdate,
        now: DateTime<Utc>,
    ) -> LedgerResult<Clock> {
        let current = self.get_clock(clock_id)?;
        if current.status != ClockStatus::Running {
            return Err(LedgerError::ConcurrencyLoss {
                entity: "clock",
                id: clock_id.to_string(),
                expected: ClockStatus::Running.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }

        let mut next = current;
        next.status = update.target_status();
        match &update {
            ClockUpdate::Met {
                evidence_artifact_id,
                actor_id,
            } => {
                next.met_at = Some(now);
                next.evidence_artifact_id = evidence_artifact_id.clone();
                next.updated_by = actor_id.clone();
            }
            ClockUpdate::Stopped { reason, actor_id } => {
                if reason.trim().is_empty() {
                    return Err(LedgerError::Validation(
                        "stopping a clock requires a reason".to_string(),
                    ));
                }
                next.stopped_at = Some(now);
                next.stop_reason = Some(reason.trim().to_string());
                next.updated_by = actor_id.clone();
            }
            ClockUpdate::Breached { actor_id } => {
                next.breached_at = Some(now);
                next.updated_by = actor_id.clone();
            }
        }

        self.store.update_clock(next.clone(), ClockStatus::Running)?;
        tracing::info!(
            "clock {} ({}) -> {}",
            next.clock_id,
            next.clock_type.code(),
            next.status.as_str()
        );

        if let Some(artifact_id) = &next.evidence_artifact_id {
            let source = NodeRef::new(NodeType::Clock, next.clock_id.clone());
            let target = NodeRef::new(NodeType::Artifact, artifact_id.clone());
            if let Err(e) =
                self.graph
                    .create_edge(EdgeType::FulfilledBy, source.clone(), target.clone(), None)
            {
                record_gap(
                    self.store.as_ref(),
                    &next.related_event_id,
                    LinkageStep::CreateEdge {
                        edge_type: EdgeType::FulfilledBy,
                        source,
                        target,
                        metadata: None,
                    },
                    &e,
                );
            }
        }
        Ok(next)
    }

    /// Classify running clocks against `now`. Pure: records nothing.
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        thresholds: &[WarningThreshold],
    ) -> LedgerResult<Vec<ClockSignal>> {
        Ok(self
            .running_clocks()?
            .into_iter()
            .filter_map(|clock| classify(clock, now, thresholds))
            .collect())
    }
}

/// Signal for one clock, if any.
pub fn classify(
    clock: Clock,
    now: DateTime<Utc>,
    thresholds: &[WarningThreshold],
) -> Option<ClockSignal> {
    if clock.status != ClockStatus::Running {
        return None;
    }
    if now >= clock.deadline {
        return Some(ClockSignal::Breach { clock });
    }

    let total = clock.deadline - clock.start_time;
    let remaining = clock.deadline - now;
    let mut applicable: Vec<&WarningThreshold> = thresholds
        .iter()
        .filter(|t| t.window() < total && remaining <= t.window())
        .collect();
    if applicable.is_empty() {
        return None;
    }
    applicable.sort_by_key(|t| t.window_minutes);
    let tightest = applicable[0].clone();
    let superseded = applicable[1..].iter().map(|t| t.name.clone()).collect();
    Some(ClockSignal::Warning {
        clock,
        threshold: tightest,
        superseded,
    })
}
