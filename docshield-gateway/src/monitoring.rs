//! HTTP surface for operators: health, readiness, snapshots and error triage.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::data_layer::{DataLayer, MonitoringSnapshot};
use crate::observability::error_tracker::{ErrorFilter, ErrorSeverity, TrackedError};
use crate::observability::health::HealthReport;

#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("Tracked error not found: {0}")]
    ErrorNotFound(String),
}

impl IntoResponse for MonitoringError {
    fn into_response(self) -> Response {
        let status = match self {
            MonitoringError::ErrorNotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<String>,
}

/// Query string accepted by `GET /monitoring/errors`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorQuery {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub severity: Option<ErrorSeverity>,
    pub resolved: Option<bool>,
    pub user_id: Option<String>,
}

impl From<ErrorQuery> for ErrorFilter {
    fn from(query: ErrorQuery) -> Self {
        ErrorFilter {
            service: query.service,
            operation: query.operation,
            severity: query.severity,
            resolved: query.resolved,
            user_id: query.user_id,
            ..Default::default()
        }
    }
}

pub fn routes(layer: Arc<DataLayer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/monitoring/snapshot", get(snapshot))
        .route("/monitoring/errors", get(list_errors))
        .route("/monitoring/errors/:id/resolve", post(resolve_error))
        .with_state(layer)
}

async fn health(State(layer): State<Arc<DataLayer>>) -> HealthReport {
    layer.health().get_health_status().await
}

async fn ready(State(layer): State<Arc<DataLayer>>) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = layer.health().is_ready_default().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let checks = layer.health().config().critical_checks.clone();
    (status, Json(ReadinessResponse { ready, checks }))
}

async fn snapshot(State(layer): State<Arc<DataLayer>>) -> Json<MonitoringSnapshot> {
    Json(layer.snapshot().await)
}

async fn list_errors(
    State(layer): State<Arc<DataLayer>>,
    Query(query): Query<ErrorQuery>,
) -> Json<Vec<TrackedError>> {
    Json(layer.tracker().get_errors_by_filter(&query.into()))
}

async fn resolve_error(
    State(layer): State<Arc<DataLayer>>,
    Path(id): Path<String>,
) -> Result<StatusCode, MonitoringError> {
    if layer.tracker().resolve_error(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MonitoringError::ErrorNotFound(id))
    }
}
