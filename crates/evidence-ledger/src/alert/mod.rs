//! Alert & Escalation Service.
//!
//! Lifecycle: ACTIVE → ACKNOWLEDGED | RESOLVED | ESCALATED, ESCALATED →
//! ESCALATED | ACKNOWLEDGED | RESOLVED, ACKNOWLEDGED → RESOLVED. Every
//! transition is a compare-and-set on the current status. An alert is
//! persisted before any notification is attempted, and notification failures
//! never touch the stored record.

pub mod dispatch;
pub mod persistence;
pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{LedgerError, LedgerResult};
use crate::ingest::{EventIngestor, NewEvent};
use crate::types::{
    Alert, AlertCategory, AlertSeverity, AlertStatus, AlertStorage, Channel, NodeType, Severity,
};

pub use dispatch::{
    ChannelTemplates, DashboardBus, DispatchReport, LogSink, Notification,
    NotificationDispatcher, NotificationSink,
};
pub use persistence::{AlertPersistence, PersistenceMode};
pub use template::Template;

/// Source system of `ALERT.*` audit events.
pub const ALERT_SOURCE: &str = "alert-service";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlert {
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub title: String,
    #[serde(default)]
    pub message: String,
    pub source_type: NodeType,
    pub source_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Overrides the category's default roles.
    #[serde(default)]
    pub assigned_roles: Option<Vec<String>>,
    /// Overrides the severity's default channels.
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Aggregate view for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSummary {
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    /// CRITICAL or BREACH alerts that still require action.
    pub active_critical: Vec<Alert>,
    pub requiring_action: Vec<Alert>,
    /// Alerts that only exist in the non-authoritative local cache.
    pub degraded_alerts: usize,
    pub storage_mode: PersistenceMode,
}

fn audit_severity(severity: AlertSeverity) -> Severity {
    match severity {
        AlertSeverity::Info => Severity::Info,
        AlertSeverity::Warning => Severity::Medium,
        AlertSeverity::Critical => Severity::High,
        AlertSeverity::Breach => Severity::Critical,
    }
}

pub struct AlertService {
    persistence: AlertPersistence,
    dispatcher: NotificationDispatcher,
    ingestor: Arc<EventIngestor>,
}

impl AlertService {
    pub fn new(
        persistence: AlertPersistence,
        dispatcher: NotificationDispatcher,
        ingestor: Arc<EventIngestor>,
    ) -> Self {
        Self {
            persistence,
            dispatcher,
            ingestor,
        }
    }

    pub fn persistence(&self) -> &AlertPersistence {
        &self.persistence
    }

    pub fn get_alert(&self, alert_id: &str) -> LedgerResult<Alert> {
        self.persistence
            .get(alert_id)?
            .ok_or_else(|| LedgerError::not_found("alert", alert_id))
    }

    pub fn list_alerts(&self) -> LedgerResult<Vec<Alert>> {
        self.persistence.list()
    }

    /// Persist an ACTIVE alert, fan it out, and record an `ALERT.CREATED` event.
    pub async fn create_alert(&self, req: NewAlert) -> LedgerResult<Alert> {
        if req.title.trim().is_empty() {
            return Err(LedgerError::Validation("alert title is required".to_string()));
        }
        if req.source_id.trim().is_empty() {
            return Err(LedgerError::Validation("alert sourceId is required".to_string()));
        }

        let channels = match req.channels {
            Some(c) if !c.is_empty() => c,
            _ => Channel::defaults_for(req.severity),
        };
        let assigned_roles = match req.assigned_roles {
            Some(r) if !r.is_empty() => r,
            _ => req.category.default_roles(),
        };
        let alert = Alert {
            alert_id: uuid::Uuid::new_v4().to_string(),
            category: req.category,
            severity: req.severity,
            status: AlertStatus::Active,
            title: req.title.trim().to_string(),
            message: req.message,
            source_type: req.source_type,
            source_id: req.source_id,
            correlation_id: req.correlation_id,
            assigned_roles,
            channels,
            escalation_level: 0,
            details: req.details,
            storage: AlertStorage::Primary,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            escalated_at: None,
            escalated_to: Vec::new(),
        };

        let alert = self.persistence.insert(alert)?;
        tracing::info!(
            "alert {} {} {} created: {}",
            alert.alert_id,
            alert.category.as_str(),
            alert.severity.as_str(),
            alert.title
        );
        self.dispatcher.dispatch(&alert).await;
        self.audit(&alert, "CREATED", None).await;
        Ok(alert)
    }

    fn guard(alert: &Alert, allowed: &[AlertStatus]) -> LedgerResult<()> {
        if allowed.contains(&alert.status) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("|");
        Err(LedgerError::ConcurrencyLoss {
            entity: "alert",
            id: alert.alert_id.clone(),
            expected,
            actual: alert.status.as_str().to_string(),
        })
    }

    pub async fn acknowledge_alert(&self, alert_id: &str, actor_id: &str) -> LedgerResult<Alert> {
        let current = self.get_alert(alert_id)?;
        Self::guard(&current, &[AlertStatus::Active, AlertStatus::Escalated])?;

        let mut next = current.clone();
        next.status = AlertStatus::Acknowledged;
        next.acknowledged_at = Some(Utc::now());
        next.acknowledged_by = Some(actor_id.to_string());
        self.persistence.update(next.clone(), current.status)?;
        tracing::info!("alert {alert_id} acknowledged by {actor_id}");
        self.audit(&next, "ACKNOWLEDGED", Some(actor_id)).await;
        Ok(next)
    }

    pub async fn resolve_alert(
        &self,
        alert_id: &str,
        actor_id: &str,
        resolution: Option<String>,
    ) -> LedgerResult<Alert> {
        let current = self.get_alert(alert_id)?;
        Self::guard(&current, &[AlertStatus::Active, AlertStatus::Escalated])?;

        let mut next = current.clone();
        next.status = AlertStatus::Resolved;
        next.resolved_at = Some(Utc::now());
        next.resolved_by = Some(actor_id.to_string());
        next.resolution = resolution;
        self.persistence.update(next.clone(), current.status)?;
        tracing::info!("alert {alert_id} resolved by {actor_id}");
        self.audit(&next, "RESOLVED", Some(actor_id)).await;
        Ok(next)
    }

    /// Raise the escalation level and severity by one step, add `escalate_to`
    /// to the assigned roles, and notify again.
    pub async fn escalate_alert(
        &self,
        alert_id: &str,
        escalate_to: Vec<String>,
    ) -> LedgerResult<Alert> {
        let current = self.get_alert(alert_id)?;
        Self::guard(&current, &[AlertStatus::Active, AlertStatus::Escalated])?;

        let mut next = current.clone();
        next.status = AlertStatus::Escalated;
        next.escalation_level = current.escalation_level.saturating_add(1);
        next.severity = current.severity.escalated();
        next.escalated_at = Some(Utc::now());
        for role in escalate_to {
            if !next.escalated_to.contains(&role) {
                next.escalated_to.push(role.clone());
            }
            if !next.assigned_roles.contains(&role) {
                next.assigned_roles.push(role);
            }
        }
        for channel in Channel::defaults_for(next.severity) {
            if !next.channels.contains(&channel) {
                next.channels.push(channel);
            }
        }

        self.persistence.update(next.clone(), current.status)?;
        tracing::info!(
            "alert {alert_id} escalated to level {} ({} -> {})",
            next.escalation_level,
            current.severity.as_str(),
            next.severity.as_str()
        );
        self.dispatcher.dispatch(&next).await;
        self.audit(&next, "ESCALATED", None).await;
        Ok(next)
    }

    pub fn summary(&self) -> LedgerResult<AlertSummary> {
        let alerts = self.persistence.list()?;
        let mut summary = AlertSummary {
            total: alerts.len(),
            by_severity: BTreeMap::new(),
            by_category: BTreeMap::new(),
            by_status: BTreeMap::new(),
            active_critical: Vec::new(),
            requiring_action: Vec::new(),
            degraded_alerts: 0,
            storage_mode: self.persistence.mode(),
        };
        for alert in alerts {
            *summary
                .by_severity
                .entry(alert.severity.as_str().to_string())
                .or_default() += 1;
            *summary
                .by_category
                .entry(alert.category.as_str().to_string())
                .or_default() += 1;
            *summary
                .by_status
                .entry(alert.status.as_str().to_string())
                .or_default() += 1;
            if alert.storage == AlertStorage::LocalCache {
                summary.degraded_alerts += 1;
            }
            if alert.status.requires_action() {
                if alert.severity >= AlertSeverity::Critical {
                    summary.active_critical.push(alert.clone());
                }
                summary.requiring_action.push(alert);
            }
        }
        Ok(summary)
    }

    /// Record the transition as an `ALERT.<ACTION>` event. Best-effort.
    async fn audit(&self, alert: &Alert, action: &str, actor_id: Option<&str>) {
        let mut req = NewEvent::new(
            format!("ALERT.{action}"),
            ALERT_SOURCE,
            json!({
                "alertId": alert.alert_id,
                "category": alert.category,
                "severity": alert.severity,
                "status": alert.status,
                "sourceType": alert.source_type,
                "sourceId": alert.source_id,
                "escalationLevel": alert.escalation_level,
                "storage": alert.storage,
                "actorId": actor_id,
            }),
        );
        req.severity = Some(audit_severity(alert.severity));
        req.correlation_id = alert.correlation_id.clone();
        req.auto_trigger_clocks = false;
        req.auto_create_edges = false;
        req.request_tsa_timestamp = Some(false);
        if let Err(e) = self.ingestor.create_event(req).await {
            tracing::warn!("audit event for alert {} not recorded: {e}", alert.alert_id);
        }
    }
}
