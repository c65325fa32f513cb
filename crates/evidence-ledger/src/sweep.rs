//! Periodic clock sweep: pre-deadline warnings and breach transitions.
//!
//! Re-running a sweep without a state change is a no-op. Warnings are keyed by
//! `(clockId, thresholdName)` and breaches by `(clockId, "BREACHED")`. A
//! notice is claimed before its alert is raised and given back if the alert
//! cannot be persisted, so the next sweep raises it instead. Breached clocks
//! whose notice is still unclaimed are picked up by every sweep.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::alert::{AlertPersistence, AlertService, NewAlert, PersistenceMode};
use crate::clock::{ClockEngine, ClockSignal, ClockUpdate, WarningThreshold, BREACH_NOTICE};
use crate::error::{LedgerError, LedgerResult};
use crate::ingest::EventIngestor;
use crate::store::EvidenceStore;
use crate::types::{AlertCategory, AlertSeverity, Clock, ClockStatus, NodeType};

/// Actor recorded on clocks breached by the sweep.
pub const SWEEP_ACTOR: &str = "clock-sweeper";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub evaluated: usize,
    pub warnings_raised: usize,
    pub breaches: usize,
    /// Breach transitions lost to a concurrent status update.
    pub lost_races: usize,
    pub alerts_created: Vec<String>,
    /// Alerts that could not be persisted; their notices were released.
    pub alert_failures: usize,
    /// Clocks skipped because of a store error.
    pub errors: usize,
}

pub struct ClockSweeper {
    store: Arc<dyn EvidenceStore>,
    clocks: Arc<ClockEngine>,
    alerts: Arc<AlertService>,
    ingestor: Arc<EventIngestor>,
    thresholds: Vec<WarningThreshold>,
}

fn clock_details(clock: &Clock) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("clockId".to_string(), clock.clock_id.clone()),
        ("clockType".to_string(), clock.clock_type.code().to_string()),
        ("regulation".to_string(), clock.regulation.as_str().to_string()),
        ("article".to_string(), clock.article.clone()),
        ("deadline".to_string(), clock.deadline.to_rfc3339()),
        ("relatedEventId".to_string(), clock.related_event_id.clone()),
    ])
}

fn breach_message(clock: &Clock) -> String {
    match clock.updated_by.as_deref() {
        Some(actor) if actor != SWEEP_ACTOR => format!(
            "{} {} marked breached by {actor}",
            clock.regulation.as_str(),
            clock.article
        ),
        _ => format!(
            "{} {} deadline passed at {}",
            clock.regulation.as_str(),
            clock.article,
            clock.deadline.to_rfc3339()
        ),
    }
}

impl ClockSweeper {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        clocks: Arc<ClockEngine>,
        alerts: Arc<AlertService>,
        ingestor: Arc<EventIngestor>,
        thresholds: Vec<WarningThreshold>,
    ) -> Self {
        Self {
            store,
            clocks,
            alerts,
            ingestor,
            thresholds,
        }
    }

    /// Evaluate every RUNNING clock against `now`, then raise any breach
    /// alert an earlier sweep or status change could not persist.
    pub async fn run_once(&self, now: DateTime<Utc>) -> LedgerResult<SweepReport> {
        recover(self.alerts.persistence());

        let mut report = SweepReport::default();
        let running = self.clocks.running_clocks()?;
        report.evaluated = running.len();
        let mut swept = HashSet::new();

        for clock in running {
            let clock_id = clock.clock_id.clone();
            swept.insert(clock_id.clone());
            let outcome = match crate::clock::classify(clock, now, &self.thresholds) {
                Some(ClockSignal::Breach { clock }) => self.breach(clock, now, &mut report).await,
                Some(ClockSignal::Warning {
                    clock,
                    threshold,
                    superseded,
                }) => self.warn(clock, threshold, superseded, &mut report).await,
                None => Ok(()),
            };
            if let Err(e) = outcome {
                tracing::error!("sweep skipped clock {clock_id}: {e}");
                report.errors += 1;
            }
        }

        self.raise_pending_breaches(&swept, &mut report).await;

        if report.warnings_raised > 0 || report.breaches > 0 || !report.alerts_created.is_empty()
        {
            tracing::info!(
                "sweep: {} clocks, {} warnings, {} breaches, {} alerts",
                report.evaluated,
                report.warnings_raised,
                report.breaches,
                report.alerts_created.len()
            );
        } else {
            tracing::debug!("sweep: {} clocks, nothing due", report.evaluated);
        }
        if report.alert_failures > 0 || report.errors > 0 {
            tracing::warn!(
                "sweep: {} alerts deferred, {} clocks skipped",
                report.alert_failures,
                report.errors
            );
        }
        Ok(report)
    }

    /// Claim the breach notice of `clock` and raise its BREACH alert.
    ///
    /// `Ok(None)` means the alert was already raised. On failure the notice is
    /// released so a later sweep retries.
    pub(crate) async fn raise_breach_alert(&self, clock: &Clock) -> LedgerResult<Option<String>> {
        if !self
            .store
            .record_clock_notice(&clock.clock_id, BREACH_NOTICE)?
        {
            return Ok(None);
        }

        let created = self
            .alerts
            .create_alert(NewAlert {
                category: AlertCategory::Deadline,
                severity: AlertSeverity::Breach,
                title: format!("{} deadline breached", clock.clock_type.code()),
                message: breach_message(clock),
                source_type: NodeType::Clock,
                source_id: clock.clock_id.clone(),
                correlation_id: Some(clock.correlation_id.clone()),
                assigned_roles: None,
                channels: None,
                details: clock_details(clock),
            })
            .await;
        match created {
            Ok(alert) => Ok(Some(alert.alert_id)),
            Err(e) => {
                self.release_notice(&clock.clock_id, BREACH_NOTICE);
                Err(e)
            }
        }
    }

    fn release_notice(&self, clock_id: &str, notice: &str) {
        if let Err(e) = self.store.release_clock_notice(clock_id, notice) {
            tracing::error!("could not release notice {notice} of clock {clock_id}: {e}");
        }
    }

    /// Clocks in `swept` were already handled by this sweep.
    async fn raise_pending_breaches(&self, swept: &HashSet<String>, report: &mut SweepReport) {
        let breached = match self.store.clocks_with_status(ClockStatus::Breached) {
            Ok(clocks) => clocks,
            Err(e) => {
                tracing::error!("sweep could not list breached clocks: {e}");
                report.errors += 1;
                return;
            }
        };

        for clock in breached.into_iter().filter(|c| !swept.contains(&c.clock_id)) {
            match self.store.has_clock_notice(&clock.clock_id, BREACH_NOTICE) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("sweep skipped breached clock {}: {e}", clock.clock_id);
                    report.errors += 1;
                    continue;
                }
            }
            match self.raise_breach_alert(&clock).await {
                Ok(Some(alert_id)) => {
                    tracing::info!(
                        "deferred breach alert {alert_id} raised for clock {}",
                        clock.clock_id
                    );
                    report.alerts_created.push(alert_id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        "breach alert for clock {} still deferred: {e}",
                        clock.clock_id
                    );
                    report.alert_failures += 1;
                }
            }
        }
    }

    async fn breach(
        &self,
        clock: Clock,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> LedgerResult<()> {
        let breached = match self.clocks.transition(
            &clock.clock_id,
            ClockUpdate::Breached {
                actor_id: Some(SWEEP_ACTOR.to_string()),
            },
            now,
        ) {
            Ok(c) => c,
            Err(LedgerError::ConcurrencyLoss { actual, .. }) => {
                tracing::debug!(
                    "sweep lost breach race on clock {} (now {actual})",
                    clock.clock_id
                );
                report.lost_races += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.breaches += 1;

        match self.raise_breach_alert(&breached).await {
            Ok(Some(alert_id)) => report.alerts_created.push(alert_id),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    "breach alert for clock {} deferred: {e}",
                    breached.clock_id
                );
                report.alert_failures += 1;
            }
        }

        if let Err(e) = self.ingestor.record_clock_status(&breached).await {
            tracing::warn!(
                "CLOCK.BREACHED event for {} not recorded: {e}",
                breached.clock_id
            );
        }
        Ok(())
    }

    async fn warn(
        &self,
        clock: Clock,
        threshold: WarningThreshold,
        superseded: Vec<String>,
        report: &mut SweepReport,
    ) -> LedgerResult<()> {
        for name in &superseded {
            self.store.record_clock_notice(&clock.clock_id, name)?;
        }
        if !self
            .store
            .record_clock_notice(&clock.clock_id, &threshold.name)?
        {
            return Ok(());
        }

        let mut details = clock_details(&clock);
        details.insert("threshold".to_string(), threshold.name.clone());
        let created = self
            .alerts
            .create_alert(NewAlert {
                category: AlertCategory::Deadline,
                severity: threshold.severity,
                title: format!(
                    "{} deadline approaching ({})",
                    clock.clock_type.code(),
                    threshold.name
                ),
                message: format!(
                    "{} {} is due at {}",
                    clock.regulation.as_str(),
                    clock.article,
                    clock.deadline.to_rfc3339()
                ),
                source_type: NodeType::Clock,
                source_id: clock.clock_id.clone(),
                correlation_id: Some(clock.correlation_id.clone()),
                assigned_roles: None,
                channels: None,
                details,
            })
            .await;
        match created {
            Ok(alert) => {
                report.warnings_raised += 1;
                report.alerts_created.push(alert.alert_id);
            }
            Err(e) => {
                tracing::error!(
                    "{} warning for clock {} deferred: {e}",
                    threshold.name,
                    clock.clock_id
                );
                self.release_notice(&clock.clock_id, &threshold.name);
                report.alert_failures += 1;
            }
        }
        Ok(())
    }

    /// Sweep on `every` until `shutdown` is notified.
    pub fn spawn(
        self: Arc<Self>,
        every: Duration,
        shutdown: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("clock sweep started: interval={}s", every.as_secs());
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("clock sweep stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::warn!("clock sweep failed: {e}");
                        }
                    }
                }
            }
        })
    }
}

fn recover(persistence: &AlertPersistence) {
    if persistence.mode() == PersistenceMode::Degraded {
        persistence.try_recover();
    }
}
