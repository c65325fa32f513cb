//! REST API tests driven through the router without a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use evidence_ledger::{EvidenceLedger, LedgerConfig};
use evidence_ledger_server::router;

fn app_with(config: LedgerConfig) -> Router {
    router(Arc::new(EvidenceLedger::in_memory(config).unwrap()))
}

fn app() -> Router {
    app_with(LedgerConfig::default())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn incident(app: &Router) -> Value {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/events",
        Some(json!({
            "eventType": "INCIDENT.CREATED",
            "sourceSystem": "siem",
            "payload": { "summary": "payment gateway outage" },
            "requestTsaTimestamp": false
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storageMode"], "ONLINE");
}

#[tokio::test]
async fn test_incident_starts_dora_and_nis2_clocks() {
    let app = app();
    let receipt = incident(&app).await;

    assert_eq!(receipt["sequenceNumber"], 1);
    assert_eq!(receipt["clocksCreated"].as_array().unwrap().len(), 2);

    let event_id = receipt["eventId"].as_str().unwrap();
    let (status, event) = send(&app, "GET", &format!("/api/v1/events/{event_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["eventType"], "INCIDENT.CREATED");
}

#[tokio::test]
async fn test_short_justification_is_unprocessable() {
    let app = app();
    let receipt = incident(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/decisions",
        Some(json!({
            "decisionType": "CLASSIFICATION",
            "outcome": "MAJOR",
            "justification": "ok",
            "actorId": "analyst-7",
            "relatedEventId": receipt["eventId"],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "E_VALIDATION");
    assert_eq!(body["error"]["retriable"], false);
}

#[tokio::test]
async fn test_clock_met_twice_conflicts() {
    let app = app();
    let receipt = incident(&app).await;
    let clock_id = receipt["clocksCreated"][0].as_str().unwrap().to_string();
    let uri = format!("/api/v1/clocks/{clock_id}/status");
    let met = json!({ "status": "MET", "actorId": "analyst-7" });

    let (status, change) = send(&app, "PATCH", &uri, Some(met.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(change["clock"]["status"], "MET");

    let (status, body) = send(&app, "PATCH", &uri, Some(met)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "E_CONCURRENCY_LOSS");
}

#[tokio::test]
async fn test_manual_clock_uses_event_correlation() {
    let app = app();
    let receipt = incident(&app).await;

    let (status, clock) = send(
        &app,
        "POST",
        "/api/v1/clocks",
        Some(json!({
            "clockType": "INTERNAL_1H_TRIAGE",
            "relatedEventId": receipt["eventId"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(clock["status"], "RUNNING");

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/clocks",
        Some(json!({
            "clockType": "INTERNAL_1H_TRIAGE",
            "relatedEventId": "missing-event",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_alert_lifecycle_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let config = LedgerConfig {
        alert_cache_path: Some(dir.path().join("alerts.jsonl")),
        ..LedgerConfig::default()
    };
    let app = app_with(config);

    let (status, alert) = send(
        &app,
        "POST",
        "/api/v1/alerts",
        Some(json!({
            "category": "CONTROL",
            "severity": "WARNING",
            "title": "Access review overdue",
            "sourceType": "CONTROL",
            "sourceId": "ctl-42",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let alert_id = alert["alertId"].as_str().unwrap().to_string();

    let (status, acked) = send(
        &app,
        "POST",
        &format!("/api/v1/alerts/{alert_id}/ack"),
        Some(json!({ "actorId": "ciso" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["status"], "ACKNOWLEDGED");

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/alerts/{alert_id}/escalate"),
        Some(json!({ "escalateTo": ["board"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, summary) = send(&app, "GET", "/api/v1/alerts/summary", None).await;
    assert_eq!(summary["total"], 1);
    assert_eq!(summary["byStatus"]["ACKNOWLEDGED"], 1);
    assert_eq!(summary["storageMode"], "ONLINE");
}

#[tokio::test]
async fn test_unknown_alert_is_not_found() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/alerts/no-such-alert/ack",
        Some(json!({ "actorId": "ciso" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "E_NOT_FOUND");
}

#[tokio::test]
async fn test_chain_verify_and_export() {
    let app = app();
    incident(&app).await;
    incident(&app).await;

    let (status, report) = send(&app, "GET", "/api/v1/chains/siem/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["intact"], true);
    assert_eq!(report["length"], 2);

    let (_, events) = send(&app, "GET", "/api/v1/chains/siem/events", None).await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["previousHash"], events[0]["payloadHash"]);
}

#[tokio::test]
async fn test_anchor_rejects_malformed_root() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/anchors",
        Some(json!({ "anchorId": "anchor-1", "merkleRoot": "not-a-digest" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let root = "ab".repeat(32);
    let (status, stamp) = send(
        &app,
        "POST",
        "/api/v1/anchors",
        Some(json!({ "anchorId": "anchor-1", "merkleRoot": root })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let stamp_id = stamp["timestampId"].as_str().unwrap();
    let (_, verdict) = send(
        &app,
        "GET",
        &format!("/api/v1/timestamps/{stamp_id}/verify"),
        None,
    )
    .await;
    assert_eq!(verdict["valid"], true);
}

#[tokio::test]
async fn test_no_linkage_gaps_on_healthy_store() {
    let app = app();
    incident(&app).await;
    let (status, gaps) = send(&app, "GET", "/api/v1/linkage-gaps", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(gaps.as_array().unwrap().is_empty());
}
