//! Per-channel notification fan-out.
//!
//! Each channel is rendered and sent on its own; a template or send failure
//! on one channel is logged and never reaches the others or the alert record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::template::Template;
use crate::error::{NotificationError, TemplateError};
use crate::types::{Alert, Channel};

/// One rendered message for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub channel: Channel,
    pub subject: String,
    pub body: String,
    pub alert: Alert,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Dashboard channel: a broadcast bus that SSE clients subscribe to.
/// Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct DashboardBus {
    tx: broadcast::Sender<Notification>,
}

impl DashboardBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for DashboardBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl NotificationSink for DashboardBus {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let _ = self.tx.send(notification.clone());
        Ok(())
    }
}

/// Writes the notification to the log. Stands in for email, Slack, and
/// webhook transports until one is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, n: &Notification) -> Result<(), NotificationError> {
        tracing::info!(
            "notify {} [{}] {}: {}",
            n.channel.as_str(),
            n.alert.alert_id,
            n.subject,
            n.body
        );
        Ok(())
    }
}

/// Subject and body templates for one channel.
#[derive(Debug, Clone)]
pub struct ChannelTemplates {
    pub subject: Template,
    pub body: Template,
}

impl ChannelTemplates {
    pub fn parse(subject: &str, body: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            subject: Template::parse(subject)?,
            body: Template::parse(body)?,
        })
    }

    pub fn default_for(channel: Channel) -> Result<Self, TemplateError> {
        match channel {
            Channel::Slack => Self::parse(
                ":rotating_light: [{{severity}}] {{title}}",
                "{{message}} (roles: {{assignedRoles}})",
            ),
            Channel::Webhook => Self::parse("{{category}}.{{status}}", "{{alertId}}"),
            Channel::Dashboard | Channel::Email => Self::parse(
                "[{{severity}}] {{title}}",
                "{{message}}\nSource: {{sourceType}} {{sourceId}}\nAssigned: {{assignedRoles}}\nEscalation level: {{escalationLevel}}\nDeadline: {{deadline?}}",
            ),
        }
    }
}

/// Value bound to `token` for `alert`: alert fields first, then `details`.
pub fn resolve_token(alert: &Alert, token: &str) -> Option<String> {
    let v = match token {
        "alertId" => alert.alert_id.clone(),
        "category" => alert.category.as_str().to_string(),
        "severity" => alert.severity.as_str().to_string(),
        "status" => alert.status.as_str().to_string(),
        "title" => alert.title.clone(),
        "message" => alert.message.clone(),
        "sourceType" => format!("{:?}", alert.source_type).to_ascii_uppercase(),
        "sourceId" => alert.source_id.clone(),
        "correlationId" => alert.correlation_id.clone()?,
        "assignedRoles" => alert.assigned_roles.join(", "),
        "escalationLevel" => alert.escalation_level.to_string(),
        "createdAt" => alert.created_at.to_rfc3339(),
        _ => return alert.details.get(token).cloned(),
    };
    Some(v)
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub delivered: Vec<Channel>,
    pub failed: Vec<(Channel, String)>,
}

pub struct NotificationDispatcher {
    sinks: HashMap<Channel, Arc<dyn NotificationSink>>,
    templates: HashMap<Channel, ChannelTemplates>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            templates: HashMap::new(),
        }
    }

    /// Dashboard on `bus`, every other channel on [`LogSink`].
    pub fn with_defaults(bus: DashboardBus) -> Self {
        let log: Arc<dyn NotificationSink> = Arc::new(LogSink);
        Self::new()
            .with_sink(Channel::Dashboard, Arc::new(bus))
            .with_sink(Channel::Email, log.clone())
            .with_sink(Channel::Slack, log.clone())
            .with_sink(Channel::Webhook, log)
    }

    pub fn with_sink(mut self, channel: Channel, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.insert(channel, sink);
        self
    }

    pub fn with_templates(mut self, channel: Channel, templates: ChannelTemplates) -> Self {
        self.templates.insert(channel, templates);
        self
    }

    fn render(&self, channel: Channel, alert: &Alert) -> Result<Notification, NotificationError> {
        let templates = match self.templates.get(&channel) {
            Some(t) => t.clone(),
            None => ChannelTemplates::default_for(channel)?,
        };
        let resolve = |token: &str| resolve_token(alert, token);
        Ok(Notification {
            channel,
            subject: templates.subject.render(resolve)?,
            body: templates.body.render(resolve)?,
            alert: alert.clone(),
        })
    }

    async fn deliver(&self, channel: Channel, alert: &Alert) -> Result<(), NotificationError> {
        let sink = self
            .sinks
            .get(&channel)
            .ok_or_else(|| NotificationError::NoSink(channel.as_str().to_string()))?;
        let notification = self.render(channel, alert)?;
        sink.send(&notification).await
    }

    /// Send `alert` to each of its channels.
    pub async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let mut report = DispatchReport::default();
        for &channel in &alert.channels {
            match self.deliver(channel, alert).await {
                Ok(()) => report.delivered.push(channel),
                Err(e) => {
                    tracing::warn!(
                        "notification failure on {} for alert {}: {e}",
                        channel.as_str(),
                        alert.alert_id
                    );
                    report.failed.push((channel, e.to_string()));
                }
            }
        }
        report
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AlertCategory, AlertSeverity, AlertStatus, AlertStorage, NodeType,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn send(&self, _n: &Notification) -> Result<(), NotificationError> {
            Err(NotificationError::Send("smtp 421".to_string()))
        }
    }

    fn breach_alert() -> Alert {
        Alert {
            alert_id: "a1".to_string(),
            category: AlertCategory::Deadline,
            severity: AlertSeverity::Breach,
            status: AlertStatus::Active,
            title: "GDPR_72H_BREACH missed".to_string(),
            message: "Supervisory authority notification overdue".to_string(),
            source_type: NodeType::Clock,
            source_id: "clock-1".to_string(),
            correlation_id: Some("inc-1".to_string()),
            assigned_roles: vec!["dpo".to_string(), "ciso".to_string()],
            channels: Channel::defaults_for(AlertSeverity::Breach),
            escalation_level: 0,
            details: BTreeMap::from([("deadline".to_string(), "2026-03-05T09:00:00Z".to_string())]),
            storage: AlertStorage::Primary,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            escalated_at: None,
            escalated_to: vec![],
        }
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_block_others() {
        let bus = DashboardBus::default();
        let mut rx = bus.subscribe();
        let dispatcher = NotificationDispatcher::with_defaults(bus)
            .with_sink(Channel::Email, Arc::new(FailingSink));

        let report = dispatcher.dispatch(&breach_alert()).await;
        assert_eq!(report.delivered, vec![Channel::Dashboard, Channel::Slack]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Channel::Email);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject, "[BREACH] GDPR_72H_BREACH missed");
        assert!(received.body.contains("Deadline: 2026-03-05T09:00:00Z"));
    }

    #[tokio::test]
    async fn test_missing_required_binding_fails_only_that_channel() {
        let dispatcher = NotificationDispatcher::with_defaults(DashboardBus::default())
            .with_templates(
                Channel::Slack,
                ChannelTemplates::parse("{{title}}", "owner: {{owner}}").unwrap(),
            );
        let report = dispatcher.dispatch(&breach_alert()).await;
        assert_eq!(report.delivered, vec![Channel::Dashboard, Channel::Email]);
        assert!(report.failed[0].1.contains("owner"));
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_reported() {
        let dispatcher = NotificationDispatcher::new();
        let report = dispatcher.dispatch(&breach_alert()).await;
        assert!(report.delivered.is_empty());
        assert_eq!(report.failed.len(), 3);
    }

    #[test]
    fn test_resolve_token_falls_back_to_details() {
        let alert = breach_alert();
        assert_eq!(resolve_token(&alert, "severity").as_deref(), Some("BREACH"));
        assert_eq!(resolve_token(&alert, "assignedRoles").as_deref(), Some("dpo, ciso"));
        assert!(resolve_token(&alert, "deadline").is_some());
        assert!(resolve_token(&alert, "unknown").is_none());
    }
}
