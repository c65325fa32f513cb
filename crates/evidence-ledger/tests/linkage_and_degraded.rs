//! Failure paths: secondary linkage gaps and degraded alert persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use evidence_ledger::alert::PersistenceMode;
use evidence_ledger::store::{ChainHead, StoreResult};
use evidence_ledger::*;

/// Evidence store whose writes can be made to fail per kind.
#[derive(Default)]
struct FlakyStore {
    inner: Arc<InMemoryStore>,
    fail_edges: AtomicBool,
    fail_clocks: AtomicBool,
    fail_clock_updates: AtomicBool,
    fail_artifacts: AtomicBool,
    fail_decision_events: AtomicBool,
}

fn offline(flag: &AtomicBool, what: &str) -> StoreResult<()> {
    if flag.load(Ordering::SeqCst) {
        Err(StoreError::Unavailable(format!("{what} partition offline")))
    } else {
        Ok(())
    }
}

impl EvidenceStore for FlakyStore {
    fn chain_head(&self, source_system: &str) -> StoreResult<Option<ChainHead>> {
        self.inner.chain_head(source_system)
    }
    fn append_event(&self, event: Event, expected_head: Option<u64>) -> StoreResult<()> {
        if event.source_system == "decision-recorder" {
            offline(&self.fail_decision_events, "decision event")?;
        }
        self.inner.append_event(event, expected_head)
    }
    fn get_event(&self, event_id: &str) -> StoreResult<Option<Event>> {
        self.inner.get_event(event_id)
    }
    fn events_for_source(&self, source_system: &str) -> StoreResult<Vec<Event>> {
        self.inner.events_for_source(source_system)
    }
    fn events_for_correlation(&self, correlation_id: &str) -> StoreResult<Vec<Event>> {
        self.inner.events_for_correlation(correlation_id)
    }
    fn insert_decision(&self, decision: Decision) -> StoreResult<()> {
        self.inner.insert_decision(decision)
    }
    fn get_decision(&self, decision_id: &str) -> StoreResult<Option<Decision>> {
        self.inner.get_decision(decision_id)
    }
    fn insert_artifact(&self, artifact: Artifact) -> StoreResult<()> {
        offline(&self.fail_artifacts, "artifact")?;
        self.inner.insert_artifact(artifact)
    }
    fn get_artifact(&self, artifact_id: &str) -> StoreResult<Option<Artifact>> {
        self.inner.get_artifact(artifact_id)
    }
    fn insert_clock(&self, clock: Clock) -> StoreResult<()> {
        offline(&self.fail_clocks, "clock")?;
        self.inner.insert_clock(clock)
    }
    fn get_clock(&self, clock_id: &str) -> StoreResult<Option<Clock>> {
        self.inner.get_clock(clock_id)
    }
    fn clocks_with_status(&self, status: ClockStatus) -> StoreResult<Vec<Clock>> {
        self.inner.clocks_with_status(status)
    }
    fn clocks_for_event(&self, event_id: &str) -> StoreResult<Vec<Clock>> {
        self.inner.clocks_for_event(event_id)
    }
    fn update_clock(&self, clock: Clock, expected: ClockStatus) -> StoreResult<()> {
        offline(&self.fail_clock_updates, "clock")?;
        self.inner.update_clock(clock, expected)
    }
    fn record_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<bool> {
        self.inner.record_clock_notice(clock_id, threshold)
    }
    fn release_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<()> {
        self.inner.release_clock_notice(clock_id, threshold)
    }
    fn has_clock_notice(&self, clock_id: &str, threshold: &str) -> StoreResult<bool> {
        self.inner.has_clock_notice(clock_id, threshold)
    }
    fn insert_edge(&self, edge: Edge) -> StoreResult<()> {
        offline(&self.fail_edges, "graph")?;
        self.inner.insert_edge(edge)
    }
    fn edges_from(&self, node: &NodeRef) -> StoreResult<Vec<Edge>> {
        self.inner.edges_from(node)
    }
    fn edges_to(&self, node: &NodeRef) -> StoreResult<Vec<Edge>> {
        self.inner.edges_to(node)
    }
    fn insert_timestamp(&self, timestamp: TsaTimestamp) -> StoreResult<()> {
        self.inner.insert_timestamp(timestamp)
    }
    fn get_timestamp(&self, timestamp_id: &str) -> StoreResult<Option<TsaTimestamp>> {
        self.inner.get_timestamp(timestamp_id)
    }
    fn timestamps_for(&self, subject: &TimestampSubject) -> StoreResult<Vec<TsaTimestamp>> {
        self.inner.timestamps_for(subject)
    }
    fn insert_linkage_gap(&self, gap: LinkageGap) -> StoreResult<()> {
        self.inner.insert_linkage_gap(gap)
    }
    fn get_linkage_gap(&self, gap_id: &str) -> StoreResult<Option<LinkageGap>> {
        self.inner.get_linkage_gap(gap_id)
    }
    fn update_linkage_gap(&self, gap: LinkageGap, expected_attempts: u32) -> StoreResult<()> {
        self.inner.update_linkage_gap(gap, expected_attempts)
    }
    fn open_linkage_gaps(&self) -> StoreResult<Vec<LinkageGap>> {
        self.inner.open_linkage_gaps()
    }
}

/// Alert store that can be switched off.
struct SwitchableAlerts {
    inner: InMemoryStore,
    down: AtomicBool,
}

impl SwitchableAlerts {
    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("primary database unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl AlertStore for SwitchableAlerts {
    fn insert_alert(&self, alert: Alert) -> StoreResult<()> {
        self.check()?;
        self.inner.insert_alert(alert)
    }
    fn get_alert(&self, alert_id: &str) -> StoreResult<Option<Alert>> {
        self.check()?;
        self.inner.get_alert(alert_id)
    }
    fn update_alert(&self, alert: Alert, expected: AlertStatus) -> StoreResult<()> {
        self.check()?;
        self.inner.update_alert(alert, expected)
    }
    fn list_alerts(&self) -> StoreResult<Vec<Alert>> {
        self.check()?;
        self.inner.list_alerts()
    }
}

fn flaky_ledger() -> (Arc<FlakyStore>, EvidenceLedger) {
    let flaky = Arc::new(FlakyStore::default());
    let backends = LedgerBackends {
        evidence: flaky.clone(),
        alerts: flaky.inner.clone(),
        authority: Arc::new(LocalTimestampAuthority::new()),
    };
    let ledger = EvidenceLedger::with_backends(LedgerConfig::default(), backends).unwrap();
    (flaky, ledger)
}

/// Ledger whose primary alert store can be switched off, with no local cache.
fn ledger_without_alert_cache() -> (Arc<SwitchableAlerts>, EvidenceLedger) {
    let alerts = Arc::new(SwitchableAlerts {
        inner: InMemoryStore::new(),
        down: AtomicBool::new(false),
    });
    let backends = LedgerBackends {
        evidence: Arc::new(InMemoryStore::new()),
        alerts: alerts.clone(),
        authority: Arc::new(LocalTimestampAuthority::new()),
    };
    let ledger = EvidenceLedger::with_backends(LedgerConfig::default(), backends).unwrap();
    (alerts, ledger)
}

fn dora_clock(ledger: &EvidenceLedger, event_id: &str) -> Clock {
    ledger
        .clocks_for_event(event_id)
        .unwrap()
        .into_iter()
        .find(|c| c.clock_type == ClockType::DoraInitialNotification)
        .unwrap()
}

fn breach_alerts(ledger: &EvidenceLedger) -> Vec<Alert> {
    ledger
        .alerts()
        .list_alerts()
        .unwrap()
        .into_iter()
        .filter(|a| a.severity == AlertSeverity::Breach && a.source_type == NodeType::Clock)
        .collect()
}

#[tokio::test]
async fn test_edge_failures_leave_event_and_open_gaps() {
    let (flaky, ledger) = flaky_ledger();
    flaky.fail_edges.store(true, Ordering::SeqCst);

    let mut req = NewEvent::new("INCIDENT.CREATED", "soc", json!({ "ticket": "SOC-19" }));
    req.related_actor_id = Some("analyst-3".to_string());
    let receipt = ledger.create_event(req).await.unwrap();

    // The event and its clocks exist; the edges do not.
    let event = ledger.get_event(&receipt.event_id).unwrap();
    assert_eq!(event.sequence_number, 1);
    assert_eq!(receipt.clocks_created.len(), 2);
    assert!(receipt.edges_created.is_empty());
    assert_eq!(receipt.linkage_gaps.len(), 1);

    // One TRIGGERS gap per clock plus the MADE_BY gap.
    let gaps = ledger.linkage_gaps().unwrap();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.iter().all(|g| g.event_id == receipt.event_id));

    // Retrying while the graph is still down keeps the gap open.
    let err = ledger.retry_linkage(&gaps[0].gap_id).await.unwrap_err();
    assert_eq!(err.code(), "E_LINKAGE");
    assert_eq!(ledger.linkage_gaps().unwrap().len(), 3);

    flaky.fail_edges.store(false, Ordering::SeqCst);
    for gap in &gaps {
        let repaired = ledger.retry_linkage(&gap.gap_id).await.unwrap();
        assert!(repaired.resolved_at.is_some());
    }
    assert!(ledger.linkage_gaps().unwrap().is_empty());

    let node = NodeRef::new(NodeType::Event, receipt.event_id.clone());
    let edges = ledger.graph().edges_from(&node).unwrap();
    let triggers: Vec<&Edge> = edges
        .iter()
        .filter(|e| e.edge_type == EdgeType::Triggers)
        .collect();
    assert_eq!(triggers.len(), 2);
    for edge in triggers {
        let metadata = edge.metadata.as_ref().unwrap();
        assert!(metadata["clockType"].is_string());
    }
    assert_eq!(
        edges.iter().filter(|e| e.edge_type == EdgeType::MadeBy).count(),
        1
    );
    assert!(ledger.verify_chain("soc").unwrap().intact);
}

#[tokio::test]
async fn test_retry_unknown_gap_is_not_found() {
    let (_, ledger) = flaky_ledger();
    let err = ledger.retry_linkage("nope").await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
}

#[tokio::test]
async fn test_alerts_fall_back_to_local_cache() {
    let dir = tempfile::tempdir().unwrap();
    let alerts = Arc::new(SwitchableAlerts {
        inner: InMemoryStore::new(),
        down: AtomicBool::new(false),
    });
    let config = LedgerConfig {
        alert_cache_path: Some(dir.path().join("alerts.jsonl")),
        ..LedgerConfig::default()
    };
    let backends = LedgerBackends {
        evidence: Arc::new(InMemoryStore::new()),
        alerts: alerts.clone(),
        authority: Arc::new(LocalTimestampAuthority::new()),
    };
    let ledger = EvidenceLedger::with_backends(config, backends).unwrap();

    let alert_req = |title: &str| NewAlert {
        category: AlertCategory::System,
        severity: AlertSeverity::Critical,
        title: title.to_string(),
        message: String::new(),
        source_type: NodeType::Event,
        source_id: "evt-1".to_string(),
        correlation_id: None,
        assigned_roles: None,
        channels: None,
        details: Default::default(),
    };

    let online = ledger.create_alert(alert_req("before outage")).await.unwrap();
    assert_eq!(online.storage, AlertStorage::Primary);

    alerts.down.store(true, Ordering::SeqCst);
    let cached = ledger.create_alert(alert_req("during outage")).await.unwrap();
    assert_eq!(cached.storage, AlertStorage::LocalCache);

    // Cached alerts keep their lifecycle.
    let acked = ledger
        .acknowledge_alert(&cached.alert_id, "oncall")
        .await
        .unwrap();
    assert_eq!(acked.status, AlertStatus::Acknowledged);

    let summary = ledger.alert_summary().unwrap();
    assert_eq!(summary.storage_mode, PersistenceMode::Degraded);
    assert_eq!(summary.degraded_alerts, 1);

    alerts.down.store(false, Ordering::SeqCst);
    assert_eq!(
        ledger.alerts().persistence().try_recover(),
        PersistenceMode::Online
    );
    let summary = ledger.alert_summary().unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.degraded_alerts, 1);
    assert_eq!(summary.storage_mode, PersistenceMode::Online);

    let after = ledger.create_alert(alert_req("after outage")).await.unwrap();
    assert_eq!(after.storage, AlertStorage::Primary);
    assert!(after.created_at <= Utc::now());
}

#[tokio::test]
async fn test_breach_alert_deferred_until_alerts_recover() {
    let (alerts, ledger) = ledger_without_alert_cache();
    let mut req = NewEvent::new("INCIDENT.CREATED", "soc", json!({ "ticket": "SOC-77" }));
    req.occurred_at = Some(Utc::now() - Duration::hours(5));
    let receipt = ledger.create_event(req).await.unwrap();

    alerts.down.store(true, Ordering::SeqCst);
    let first = ledger.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(first.breaches, 1);
    assert_eq!(first.alert_failures, 1);
    assert!(first.alerts_created.is_empty());
    assert_eq!(
        dora_clock(&ledger, &receipt.event_id).status,
        ClockStatus::Breached
    );

    alerts.down.store(false, Ordering::SeqCst);
    let second = ledger.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(second.breaches, 0);
    assert_eq!(second.alerts_created.len(), 1);
    assert_eq!(second.alert_failures, 0);

    let third = ledger.sweep_once(Utc::now()).await.unwrap();
    assert!(third.alerts_created.is_empty());

    let raised = breach_alerts(&ledger);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].alert_id, second.alerts_created[0]);
    assert!(raised[0].message.contains("deadline passed"));
}

#[tokio::test]
async fn test_manual_breach_alert_raised_by_next_sweep() {
    let (alerts, ledger) = ledger_without_alert_cache();
    let receipt = ledger
        .create_event(NewEvent::new(
            "INCIDENT.CREATED",
            "soc",
            json!({ "ticket": "SOC-78" }),
        ))
        .await
        .unwrap();
    let dora = dora_clock(&ledger, &receipt.event_id);

    alerts.down.store(true, Ordering::SeqCst);
    let change = ledger
        .update_clock_status(
            &dora.clock_id,
            ClockUpdate::Breached {
                actor_id: Some("ciso".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(change.clock.status, ClockStatus::Breached);
    assert!(change.event_id.is_some());
    assert!(change.alert_id.is_none());

    alerts.down.store(false, Ordering::SeqCst);
    let report = ledger.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(report.alerts_created.len(), 1);

    let raised = breach_alerts(&ledger);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].source_id, dora.clock_id);
    assert!(raised[0].message.contains("marked breached by ciso"));
}

#[tokio::test]
async fn test_sweep_skips_clocks_it_cannot_update() {
    let (flaky, ledger) = flaky_ledger();
    for ticket in ["SOC-80", "SOC-81"] {
        let mut req = NewEvent::new("INCIDENT.TRIAGE_REQUIRED", "soc", json!({ "ticket": ticket }));
        req.occurred_at = Some(Utc::now() - Duration::hours(2));
        ledger.create_event(req).await.unwrap();
    }

    flaky.fail_clock_updates.store(true, Ordering::SeqCst);
    let failed = ledger.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(failed.evaluated, 2);
    assert_eq!(failed.errors, 2);
    assert_eq!(failed.breaches, 0);

    flaky.fail_clock_updates.store(false, Ordering::SeqCst);
    let recovered = ledger.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(recovered.errors, 0);
    assert_eq!(recovered.breaches, 2);
    assert_eq!(recovered.alerts_created.len(), 2);
}

#[tokio::test]
async fn test_partial_decision_failure_is_repairable() {
    let (flaky, ledger) = flaky_ledger();
    let trigger = ledger
        .create_event(NewEvent::new(
            "LOAN.APPLICATION_SCORED",
            "credit-engine",
            json!({ "applicationId": "APP-311", "score": 412 }),
        ))
        .await
        .unwrap();

    flaky.fail_artifacts.store(true, Ordering::SeqCst);
    flaky.fail_decision_events.store(true, Ordering::SeqCst);
    let receipt = ledger
        .create_decision(NewDecision {
            decision_type: "loan_override".to_string(),
            outcome: "APPROVED".to_string(),
            justification: Some("Income verified manually against payslips".to_string()),
            actor_id: "underwriter-7".to_string(),
            related_event_id: trigger.event_id.clone(),
            ai_assisted: false,
            ai_confidence: None,
            human_verified: true,
            create_artifact: true,
        })
        .await
        .unwrap();

    // The decision and its MADE_BY / LEADS_TO edges exist.
    ledger.get_decision(&receipt.decision_id).unwrap();
    assert_eq!(receipt.edges_created.len(), 2);
    assert!(receipt.artifact_id.is_none());
    assert!(receipt.event_id.is_none());
    assert_eq!(receipt.linkage_gaps.len(), 2);

    let gaps = ledger.linkage_gaps().unwrap();
    assert_eq!(gaps.len(), 2);
    assert!(gaps.iter().all(|g| g.event_id == trigger.event_id));
    assert!(gaps.iter().any(|g| matches!(
        &g.step,
        LinkageStep::DecisionArtifact { decision_id } if *decision_id == receipt.decision_id
    )));
    assert!(gaps.iter().any(|g| matches!(
        &g.step,
        LinkageStep::DecisionEvent { decision_id } if *decision_id == receipt.decision_id
    )));

    flaky.fail_artifacts.store(false, Ordering::SeqCst);
    flaky.fail_decision_events.store(false, Ordering::SeqCst);
    for gap in &gaps {
        let repaired = ledger.retry_linkage(&gap.gap_id).await.unwrap();
        assert!(repaired.resolved_at.is_some());
    }
    assert!(ledger.linkage_gaps().unwrap().is_empty());

    let node = NodeRef::new(NodeType::Decision, receipt.decision_id.clone());
    let produces: Vec<Edge> = ledger
        .graph()
        .edges_from(&node)
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == EdgeType::Produces)
        .collect();
    assert_eq!(produces.len(), 1);
    assert_eq!(produces[0].target_node_type, NodeType::Artifact);

    let derived = ledger.chain_events("decision-recorder").unwrap();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].event_type, "DECISION.LOAN_OVERRIDE");
    assert_eq!(derived[0].causation_id.as_deref(), Some(trigger.event_id.as_str()));
    assert!(ledger.verify_chain("decision-recorder").unwrap().intact);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_create_one_clock() {
    let (flaky, ledger) = flaky_ledger();
    flaky.fail_clocks.store(true, Ordering::SeqCst);
    let receipt = ledger
        .create_event(NewEvent::new(
            "INCIDENT.CREATED",
            "soc",
            json!({ "ticket": "SOC-90" }),
        ))
        .await
        .unwrap();
    assert!(receipt.clocks_created.is_empty());

    let gap = ledger
        .linkage_gaps()
        .unwrap()
        .into_iter()
        .find(|g| matches!(g.step, LinkageStep::TriggerClock { .. }))
        .unwrap();
    let LinkageStep::TriggerClock { clock_type, .. } = gap.step else {
        unreachable!()
    };
    flaky.fail_clocks.store(false, Ordering::SeqCst);

    let ledger = Arc::new(ledger);
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            let gap_id = gap.gap_id.clone();
            tokio::spawn(async move { ledger.retry_linkage(&gap_id).await })
        })
        .collect();

    let mut repaired = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(g) => {
                assert!(g.resolved_at.is_some());
                repaired += 1;
            }
            Err(e) => assert!(matches!(e, LedgerError::ConcurrencyLoss { .. }), "{e}"),
        }
    }
    assert!(repaired >= 1);

    let clocks = ledger.clocks_for_event(&receipt.event_id).unwrap();
    assert_eq!(
        clocks.iter().filter(|c| c.clock_type == clock_type).count(),
        1
    );
    let settled = ledger
        .linkage_gaps()
        .unwrap()
        .into_iter()
        .all(|g| g.gap_id != gap.gap_id);
    assert!(settled);
}
