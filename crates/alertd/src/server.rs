//! HTTP server for alertd.
//!
//! Provides REST API endpoints for:
//! - Alert intake (Alertmanager webhook or native alerts)
//! - Mode, target and outcome status
//! - Prometheus metrics, liveness and readiness

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use publishing::{PublishingSystem, SubmitResponse, TargetId};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::api::{
    is_retryable, AlertsRequest, BatchResponse, ErrorResponse, ModeResponse, OutcomesQuery,
    OutcomesResponse, TargetView, TargetsResponse,
};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const DEFAULT_OUTCOME_LIMIT: usize = 50;
const MAX_OUTCOME_LIMIT: usize = 1000;

/// Server state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub system: Arc<PublishingSystem>,
}

impl AppState {
    pub fn new(system: Arc<PublishingSystem>) -> Self {
        Self { system }
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/alerts", post(submit_alerts_handler))
        .route("/api/v1/mode", get(mode_handler))
        .route("/api/v1/targets", get(targets_handler))
        .route(
            "/api/v1/targets/{namespace}/{name}/probe",
            post(probe_target_handler),
        )
        .route("/api/v1/outcomes", get(outcomes_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn submit_status(response: &SubmitResponse) -> StatusCode {
    match response.rejected_reason {
        None => StatusCode::ACCEPTED,
        reason if is_retryable(reason) => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::BAD_REQUEST,
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready once the first discovery refresh succeeded.
async fn ready_handler(State(state): State<AppState>) -> Response {
    let mode = state.system.mode().current_mode();
    if state.system.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready", "mode": mode }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "mode": mode })),
        )
            .into_response()
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.system.metrics().gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
        }
    }
}

async fn submit_alerts_handler(
    State(state): State<AppState>,
    Json(request): Json<AlertsRequest>,
) -> Response {
    match request {
        AlertsRequest::Single(alert) => {
            let response = state.system.submit_alert(alert).await;
            (submit_status(&response), Json(response)).into_response()
        }
        AlertsRequest::Webhook(message) => {
            debug!(
                receiver = message.receiver.as_deref().unwrap_or_default(),
                alerts = message.alerts.len(),
                "Received Alertmanager notification"
            );
            let mut results = Vec::with_capacity(message.alerts.len());
            for alert in message.alerts {
                results.push(state.system.submit_alert(alert.into_alert()).await);
            }

            let batch = BatchResponse::new(results);
            let status = if batch.should_retry() {
                StatusCode::SERVICE_UNAVAILABLE
            } else if batch.accepted == 0 && batch.rejected > 0 {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::ACCEPTED
            };
            (status, Json(batch)).into_response()
        }
    }
}

async fn mode_handler(State(state): State<AppState>) -> Json<ModeResponse> {
    let queue = state.system.queue();
    Json(ModeResponse {
        metrics: state.system.mode().mode_metrics(),
        queue_depth: queue.depth(),
        queue_capacity: queue.capacity(),
        deferred_jobs: queue.deferred_len(),
    })
}

async fn targets_handler(State(state): State<AppState>) -> Json<TargetsResponse> {
    let discovery = state.system.discovery();
    let health = state.system.health();

    let mut targets: Vec<TargetView> = discovery
        .list_targets()
        .iter()
        .map(|t| TargetView::new(t, health.get_health(&t.id)))
        .collect();
    targets.sort_by(|a, b| a.id.cmp(&b.id));

    Json(TargetsResponse {
        discovery: discovery.status(),
        targets,
    })
}

/// Probe one target immediately and return its updated health.
async fn probe_target_handler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let id = TargetId::new(&namespace, &name);
    match state.system.health().probe_now(&id).await {
        Some(record) => {
            info!(target_id = %id, status = ?record.status, "Manual probe completed");
            Json(record).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("unknown target {id}")),
    }
}

async fn outcomes_handler(
    State(state): State<AppState>,
    Query(query): Query<OutcomesQuery>,
) -> Json<OutcomesResponse> {
    let outcomes = state.system.outcomes();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_OUTCOME_LIMIT)
        .min(MAX_OUTCOME_LIMIT);

    let reports = match query.alert_id {
        Some(alert_id) => {
            let mut reports = outcomes.for_alert(&alert_id);
            reports.reverse();
            reports.truncate(limit);
            reports
        }
        None => outcomes.recent(limit),
    };

    Json(OutcomesResponse {
        total: outcomes.total(),
        reports,
    })
}
