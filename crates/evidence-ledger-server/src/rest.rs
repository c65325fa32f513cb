//! REST API over the evidence ledger.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use evidence_ledger::{
    ClockType, ClockUpdate, ContentHash, EvidenceLedger, LedgerError, NewAlert, NewClock,
    NewDecision, NewEvent,
};

type AppState = Arc<EvidenceLedger>;

/// Ledger error rendered as `{"error": {code, message, retriable}}`.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &LedgerError) -> StatusCode {
    match error.code() {
        "E_VALIDATION" | "E_TEMPLATE" => StatusCode::UNPROCESSABLE_ENTITY,
        "E_NOT_FOUND" => StatusCode::NOT_FOUND,
        "E_CHAIN_CONFLICT" | "E_CONCURRENCY_LOSS" => StatusCode::CONFLICT,
        "E_STORE_UNAVAILABLE" | "E_EXTERNAL_TIMESTAMP" => StatusCode::SERVICE_UNAVAILABLE,
        "E_LINKAGE" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "retriable": self.0.is_retriable(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClockBody {
    pub clock_type: ClockType,
    pub related_event_id: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBody {
    pub actor_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveBody {
    pub actor_id: String,
    #[serde(default)]
    pub resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalateBody {
    pub escalate_to: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorBody {
    pub anchor_id: String,
    pub merkle_root: String,
}

/// Build the router.
pub fn router(ledger: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/events", post(create_event))
        .route("/api/v1/events/:id", get(get_event))
        .route("/api/v1/correlations/:id/events", get(correlation_events))
        .route("/api/v1/decisions", post(create_decision))
        .route("/api/v1/decisions/:id", get(get_decision))
        .route("/api/v1/clocks", post(create_clock))
        .route("/api/v1/clocks/:id", get(get_clock))
        .route("/api/v1/clocks/:id/status", patch(update_clock_status))
        .route("/api/v1/alerts", post(create_alert).get(list_alerts))
        .route("/api/v1/alerts/summary", get(alert_summary))
        .route("/api/v1/alerts/stream", get(alert_stream))
        .route("/api/v1/alerts/:id", get(get_alert))
        .route("/api/v1/alerts/:id/ack", post(acknowledge_alert))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        .route("/api/v1/alerts/:id/escalate", post(escalate_alert))
        .route("/api/v1/chains/:source/events", get(chain_events))
        .route("/api/v1/chains/:source/verify", get(verify_chain))
        .route("/api/v1/anchors", post(timestamp_anchor))
        .route("/api/v1/timestamps/:id/verify", get(verify_timestamp))
        .route("/api/v1/linkage-gaps", get(linkage_gaps))
        .route("/api/v1/linkage-gaps/:id/retry", post(retry_linkage))
        .layer(cors)
        .with_state(ledger)
}

/// Start the REST API server. Returns when `shutdown` resolves.
pub async fn start(
    addr: &str,
    ledger: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(ledger);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST API listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ── Handlers ──

async fn health(State(ledger): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "storageMode": ledger.alerts().persistence().mode(),
        "dashboardSubscribers": ledger.dashboard().subscriber_count(),
    }))
}

async fn create_event(
    State(ledger): State<AppState>,
    Json(body): Json<NewEvent>,
) -> ApiResult<impl IntoResponse> {
    let receipt = ledger.create_event(body).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_event(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.get_event(&id)?))
}

async fn correlation_events(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.events_for_correlation(&id)?))
}

async fn create_decision(
    State(ledger): State<AppState>,
    Json(body): Json<NewDecision>,
) -> ApiResult<impl IntoResponse> {
    let receipt = ledger.create_decision(body).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_decision(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.get_decision(&id)?))
}

async fn create_clock(
    State(ledger): State<AppState>,
    Json(body): Json<CreateClockBody>,
) -> ApiResult<impl IntoResponse> {
    let event = ledger.get_event(&body.related_event_id)?;
    let clock = ledger.create_clock(NewClock {
        clock_type: body.clock_type,
        start_time: body.start_time.unwrap_or(event.occurred_at),
        deadline_override: body.deadline,
        related_event_id: event.event_id,
        correlation_id: event.correlation_id,
    })?;
    Ok((StatusCode::CREATED, Json(clock)))
}

async fn get_clock(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.get_clock(&id)?))
}

async fn update_clock_status(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ClockUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.update_clock_status(&id, body).await?))
}

async fn create_alert(
    State(ledger): State<AppState>,
    Json(body): Json<NewAlert>,
) -> ApiResult<impl IntoResponse> {
    let alert = ledger.create_alert(body).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn list_alerts(State(ledger): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.alerts().list_alerts()?))
}

async fn get_alert(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.alerts().get_alert(&id)?))
}

async fn acknowledge_alert(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AckBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.acknowledge_alert(&id, &body.actor_id).await?))
}

async fn resolve_alert(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        ledger
            .resolve_alert(&id, &body.actor_id, body.resolution)
            .await?,
    ))
}

async fn escalate_alert(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EscalateBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.escalate_alert(&id, body.escalate_to).await?))
}

async fn alert_summary(State(ledger): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.alert_summary()?))
}

/// Dashboard channel as server-sent events, one `alert` event per delivery.
async fn alert_stream(
    State(ledger): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = ledger.dashboard().subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let data = serde_json::to_string(&notification).unwrap_or_default();
                    yield Ok(SseEvent::default().event("alert").data(data));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("dashboard stream lagged, {skipped} notifications dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn chain_events(
    State(ledger): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.chain_events(&source)?))
}

async fn verify_chain(
    State(ledger): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.verify_chain(&source)?))
}

async fn timestamp_anchor(
    State(ledger): State<AppState>,
    Json(body): Json<AnchorBody>,
) -> ApiResult<impl IntoResponse> {
    let root = ContentHash(body.merkle_root);
    let stamp = ledger.timestamp_anchor(&body.anchor_id, &root).await?;
    Ok((StatusCode::CREATED, Json(stamp)))
}

async fn verify_timestamp(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let valid = ledger.verify_timestamp(&id)?;
    Ok(Json(json!({ "timestampId": id, "valid": valid })))
}

async fn linkage_gaps(State(ledger): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.linkage_gaps()?))
}

async fn retry_linkage(
    State(ledger): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ledger.retry_linkage(&id).await?))
}
