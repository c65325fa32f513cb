//! The evidence ledger: every service, constructed once and wired together.
//!
//! Services only hold what they need (the ingestor knows nothing about
//! alerts, the clock engine emits no events). Behavior that spans several
//! services lives here: ingestion alert rules, `CLOCK.<STATUS>` events for
//! explicit status changes, and the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::alert::{
    AlertPersistence, AlertService, AlertSummary, DashboardBus, NewAlert, NotificationDispatcher,
};
use crate::alert_cache::AlertCache;
use crate::clock::{ClockEngine, ClockUpdate, NewClock};
use crate::config::LedgerConfig;
use crate::decision::{DecisionReceipt, DecisionRecorder, NewDecision};
use crate::error::{LedgerError, LedgerResult};
use crate::graph::EdgeGraph;
use crate::hash_chain::{ChainReport, HashChainAuthority};
use crate::ingest::{EventIngestor, EventReceipt, NewEvent};
use crate::linkage::{claim_gap, settle_gap};
use crate::store::{AlertStore, EvidenceStore, InMemoryStore};
use crate::sweep::{ClockSweeper, SweepReport};
use crate::tsa::{LocalTimestampAuthority, TimestampAuthority, TimestampClient};
use crate::types::{
    Alert, AlertCategory, AlertSeverity, Clock, ClockStatus, ContentHash, Decision, Event,
    LinkageGap, LinkageStep, NodeType, Severity, TsaTimestamp,
};

/// Storage and external collaborators.
pub struct LedgerBackends {
    pub evidence: Arc<dyn EvidenceStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub authority: Arc<dyn TimestampAuthority>,
}

impl LedgerBackends {
    /// One in-memory store for everything and the local timestamp authority.
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            evidence: store.clone(),
            alerts: store,
            authority: Arc::new(LocalTimestampAuthority::new()),
        }
    }
}

/// Result of an explicit clock status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockStatusChange {
    pub clock: Clock,
    /// The `CLOCK.<STATUS>` event, when it could be recorded.
    pub event_id: Option<String>,
    pub alert_id: Option<String>,
}

/// Category and severity of the alert an ingested event raises, if any.
pub fn ingestion_alert_rule(event: &Event) -> Option<(AlertCategory, AlertSeverity)> {
    let severity = match event.severity {
        Severity::Critical => AlertSeverity::Critical,
        Severity::High => AlertSeverity::Warning,
        _ => AlertSeverity::Info,
    };
    let ty = event.event_type.as_str();
    if ty.starts_with("BREACH.") {
        Some((AlertCategory::Breach, severity.max(AlertSeverity::Critical)))
    } else if ty.starts_with("AI.") && ty.ends_with(".BLOCKED") {
        Some((AlertCategory::AiGovernance, severity.max(AlertSeverity::Warning)))
    } else if event.severity == Severity::Critical {
        Some((AlertCategory::Incident, AlertSeverity::Critical))
    } else {
        None
    }
}

pub struct EvidenceLedger {
    config: LedgerConfig,
    store: Arc<dyn EvidenceStore>,
    chain: Arc<HashChainAuthority>,
    graph: Arc<EdgeGraph>,
    clocks: Arc<ClockEngine>,
    tsa: Arc<TimestampClient>,
    ingestor: Arc<EventIngestor>,
    decisions: DecisionRecorder,
    alerts: Arc<AlertService>,
    sweeper: Arc<ClockSweeper>,
    dashboard: DashboardBus,
}

impl EvidenceLedger {
    pub fn in_memory(config: LedgerConfig) -> LedgerResult<Self> {
        Self::with_backends(config, LedgerBackends::in_memory())
    }

    /// Dashboard notifications on a broadcast bus, other channels logged.
    pub fn with_backends(config: LedgerConfig, backends: LedgerBackends) -> LedgerResult<Self> {
        let dashboard = DashboardBus::new(config.dashboard_capacity);
        let dispatcher = NotificationDispatcher::with_defaults(dashboard.clone());
        Self::with_dispatcher(config, backends, dashboard, dispatcher)
    }

    pub fn with_dispatcher(
        config: LedgerConfig,
        backends: LedgerBackends,
        dashboard: DashboardBus,
        dispatcher: NotificationDispatcher,
    ) -> LedgerResult<Self> {
        let store = backends.evidence;
        let chain = Arc::new(HashChainAuthority::new(store.clone()));
        let graph = Arc::new(EdgeGraph::new(store.clone()));
        let clocks = Arc::new(ClockEngine::new(store.clone(), graph.clone()));
        let tsa = Arc::new(TimestampClient::new(
            store.clone(),
            backends.authority,
            config.tsa_timeout,
        ));
        let ingestor = Arc::new(EventIngestor::new(
            store.clone(),
            chain.clone(),
            clocks.clone(),
            graph.clone(),
            tsa.clone(),
            config.fallback_regulation,
        ));
        let decisions = DecisionRecorder::new(store.clone(), graph.clone(), ingestor.clone());

        let cache = match &config.alert_cache_path {
            Some(path) => Some(AlertCache::open(path)?),
            None => None,
        };
        let persistence = AlertPersistence::new(backends.alerts, cache);
        let alerts = Arc::new(AlertService::new(persistence, dispatcher, ingestor.clone()));
        let sweeper = Arc::new(ClockSweeper::new(
            store.clone(),
            clocks.clone(),
            alerts.clone(),
            ingestor.clone(),
            config.warning_thresholds.clone(),
        ));

        tracing::info!(
            "evidence ledger ready: tsa={} fallback={} alert_cache={}",
            tsa.provider(),
            config.fallback_regulation.as_str(),
            config
                .alert_cache_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "off".to_string())
        );

        Ok(Self {
            config,
            store,
            chain,
            graph,
            clocks,
            tsa,
            ingestor,
            decisions,
            alerts,
            sweeper,
            dashboard,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn graph(&self) -> &EdgeGraph {
        &self.graph
    }

    pub fn dashboard(&self) -> &DashboardBus {
        &self.dashboard
    }

    pub fn alerts(&self) -> &AlertService {
        &self.alerts
    }

    // ── Events ──

    /// Record an event, then apply the ingestion alert rules.
    pub async fn create_event(&self, req: NewEvent) -> LedgerResult<EventReceipt> {
        let mut receipt = self.ingestor.create_event(req).await?;
        let event = self.ingestor.get_event(&receipt.event_id)?;

        if let Some((category, severity)) = ingestion_alert_rule(&event) {
            let created = self
                .alerts
                .create_alert(NewAlert {
                    category,
                    severity,
                    title: format!("{} from {}", event.event_type, event.source_system),
                    message: format!(
                        "{} event recorded at sequence {}",
                        event.severity.as_str(),
                        event.sequence_number
                    ),
                    source_type: NodeType::Event,
                    source_id: event.event_id.clone(),
                    correlation_id: Some(event.correlation_id.clone()),
                    assigned_roles: None,
                    channels: None,
                    details: [
                        ("eventType".to_string(), event.event_type.clone()),
                        ("sourceSystem".to_string(), event.source_system.clone()),
                    ]
                    .into_iter()
                    .collect(),
                })
                .await;
            match created {
                Ok(alert) => receipt.alert_id = Some(alert.alert_id),
                Err(e) => tracing::warn!("alert for event {} not raised: {e}", event.event_id),
            }
        }
        Ok(receipt)
    }

    pub fn get_event(&self, event_id: &str) -> LedgerResult<Event> {
        self.ingestor.get_event(event_id)
    }

    pub fn events_for_correlation(&self, correlation_id: &str) -> LedgerResult<Vec<Event>> {
        Ok(self.store.events_for_correlation(correlation_id)?)
    }

    /// Every event of one source, in chain order.
    pub fn chain_events(&self, source_system: &str) -> LedgerResult<Vec<Event>> {
        Ok(self.store.events_for_source(source_system)?)
    }

    pub fn verify_chain(&self, source_system: &str) -> LedgerResult<ChainReport> {
        self.chain.verify_chain(source_system)
    }

    // ── Decisions ──

    pub async fn create_decision(&self, req: NewDecision) -> LedgerResult<DecisionReceipt> {
        self.decisions.create_decision(req).await
    }

    pub fn get_decision(&self, decision_id: &str) -> LedgerResult<Decision> {
        self.decisions.get_decision(decision_id)
    }

    // ── Clocks ──

    /// Start a clock explicitly. The originating event must exist.
    pub fn create_clock(&self, req: NewClock) -> LedgerResult<Clock> {
        self.ingestor.get_event(&req.related_event_id)?;
        self.clocks.create_clock(req)
    }

    pub fn get_clock(&self, clock_id: &str) -> LedgerResult<Clock> {
        self.clocks.get_clock(clock_id)
    }

    pub fn clocks_for_event(&self, event_id: &str) -> LedgerResult<Vec<Clock>> {
        Ok(self.store.clocks_for_event(event_id)?)
    }

    /// Explicit MET / STOPPED / BREACHED transition, recorded as a
    /// `CLOCK.<STATUS>` event. A manual breach raises the same alert the sweep
    /// would.
    pub async fn update_clock_status(
        &self,
        clock_id: &str,
        update: ClockUpdate,
    ) -> LedgerResult<ClockStatusChange> {
        let clock = self.clocks.transition(clock_id, update, Utc::now())?;

        let event_id = match self.ingestor.record_clock_status(&clock).await {
            Ok(r) => Some(r.event_id),
            Err(e) => {
                tracing::warn!(
                    "CLOCK.{} event for {clock_id} not recorded: {e}",
                    clock.status.as_str()
                );
                None
            }
        };

        let mut alert_id = None;
        if clock.status == ClockStatus::Breached {
            match self.sweeper.raise_breach_alert(&clock).await {
                Ok(id) => alert_id = id,
                Err(e) => tracing::warn!(
                    "breach alert for clock {clock_id} deferred to the next sweep: {e}"
                ),
            }
        }

        Ok(ClockStatusChange {
            clock,
            event_id,
            alert_id,
        })
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> LedgerResult<SweepReport> {
        self.sweeper.run_once(now).await
    }

    pub fn spawn_sweeper(&self, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        self.sweeper
            .clone()
            .spawn(self.config.sweep_interval, shutdown)
    }

    // ── Alerts ──

    pub async fn create_alert(&self, req: NewAlert) -> LedgerResult<Alert> {
        self.alerts.create_alert(req).await
    }

    pub async fn acknowledge_alert(&self, alert_id: &str, actor_id: &str) -> LedgerResult<Alert> {
        self.alerts.acknowledge_alert(alert_id, actor_id).await
    }

    pub async fn resolve_alert(
        &self,
        alert_id: &str,
        actor_id: &str,
        resolution: Option<String>,
    ) -> LedgerResult<Alert> {
        self.alerts.resolve_alert(alert_id, actor_id, resolution).await
    }

    pub async fn escalate_alert(
        &self,
        alert_id: &str,
        escalate_to: Vec<String>,
    ) -> LedgerResult<Alert> {
        self.alerts.escalate_alert(alert_id, escalate_to).await
    }

    pub fn alert_summary(&self) -> LedgerResult<AlertSummary> {
        self.alerts.summary()
    }

    // ── Timestamps ──

    pub async fn timestamp_anchor(
        &self,
        anchor_id: &str,
        merkle_root: &ContentHash,
    ) -> LedgerResult<TsaTimestamp> {
        if !merkle_root.is_well_formed() {
            return Err(LedgerError::Validation(format!(
                "anchor root is not a sha-256 hex digest: {merkle_root}"
            )));
        }
        self.tsa.timestamp_anchor(anchor_id, merkle_root).await
    }

    pub fn verify_timestamp(&self, timestamp_id: &str) -> LedgerResult<bool> {
        self.tsa.verify_timestamp(timestamp_id)
    }

    // ── Linkage repair ──

    pub fn linkage_gaps(&self) -> LedgerResult<Vec<LinkageGap>> {
        self.ingestor.open_linkage_gaps()
    }

    /// Re-run the failed step of a linkage gap.
    ///
    /// The gap is claimed first; a concurrent retry of the same gap gets
    /// `ConcurrencyLoss`. Retrying a resolved gap returns it unchanged.
    pub async fn retry_linkage(&self, gap_id: &str) -> LedgerResult<LinkageGap> {
        let gap = claim_gap(self.store.as_ref(), gap_id, Utc::now())?;
        if gap.resolved_at.is_some() {
            return Ok(gap);
        }

        let outcome = match &gap.step {
            LinkageStep::DecisionArtifact { decision_id } => {
                self.decisions.repair_artifact(decision_id, &gap.event_id)
            }
            LinkageStep::DecisionEvent { decision_id } => {
                self.decisions.repair_event(decision_id).await
            }
            step => self.ingestor.repair(&gap.event_id, step).await,
        };
        settle_gap(self.store.as_ref(), gap, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, severity: Severity) -> Event {
        Event {
            event_id: "e1".to_string(),
            correlation_id: "c1".to_string(),
            causation_id: None,
            sequence_number: 1,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            event_type: event_type.to_string(),
            severity,
            source_system: "s".to_string(),
            regulatory_tags: vec![],
            articles: vec![],
            payload: json!({}),
            payload_hash: ContentHash::genesis(),
            previous_hash: ContentHash::genesis(),
        }
    }

    #[test]
    fn test_ingestion_alert_rules() {
        assert_eq!(
            ingestion_alert_rule(&event("BREACH.DETECTED", Severity::Critical)),
            Some((AlertCategory::Breach, AlertSeverity::Critical))
        );
        assert_eq!(
            ingestion_alert_rule(&event("AI.PROMPT.BLOCKED", Severity::Critical)),
            Some((AlertCategory::AiGovernance, AlertSeverity::Critical))
        );
        assert_eq!(
            ingestion_alert_rule(&event("AI.OUTPUT.BLOCKED", Severity::Low)),
            Some((AlertCategory::AiGovernance, AlertSeverity::Warning))
        );
        assert_eq!(
            ingestion_alert_rule(&event("PAYMENT.OUTAGE", Severity::Critical)),
            Some((AlertCategory::Incident, AlertSeverity::Critical))
        );
        assert_eq!(ingestion_alert_rule(&event("INCIDENT.CREATED", Severity::Info)), None);
    }
}
