//! HTTP task delivery.
//!
//! The queue delivers each task as a POST of its [`TaskEnvelope`] to
//! `{prefix}/{kind}`. The response status tells the queue what to do:
//!
//! | Outcome | Status |
//! |---------|--------|
//! | completed, duplicate, not ready, exhausted | `200` |
//! | retryable failure | `503` (redeliver) |
//! | invalid request or unknown tenant | `400` |
//! | unknown run | `404` |
//! | anything else | `500` |
//!
//! Operators start runs, inspect them, and re-trigger the fan-in and
//! aggregation steps through the `runs` routes.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::coordinator::{Coordinator, Handled, StartRequest, StartSummary};
use crate::dispatch::TaskEnvelope;
use crate::error::Error;
use crate::run::{RunKey, RunStatus};

/// Error payload detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiErrorDetail {
    /// Stable error code.
    pub error_code: String,
    /// Human readable message.
    pub message: String,
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiErrorResponse {
    /// Error detail.
    pub error: ApiErrorDetail,
}

/// Handler error wrapping [`Error`].
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        Self(value)
    }
}

impl ApiError {
    /// Returns the status code and stable error code for the error.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::InvalidRequest { .. }
            | Error::UnknownTenant { .. }
            | Error::Core(tally_core::Error::InvalidId { .. } | tally_core::Error::InvalidInput(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
            }
            Error::RunNotFound { .. } => (StatusCode::NOT_FOUND, "RUN_NOT_FOUND"),
            e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "RETRYABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "task handler failed");
        }
        let payload = ApiErrorResponse {
            error: ApiErrorDetail {
                error_code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Builds the task delivery and operator router.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let prefix = coordinator.config().task_path_prefix.clone();
    Router::new()
        .route("/health", get(health))
        .route(&format!("{prefix}/runs"), post(start_run))
        .route(&format!("{prefix}/runs/:key"), get(run_status))
        .route(&format!("{prefix}/runs/:key/joins"), post(redispatch_joins))
        .route(&format!("{prefix}/runs/:key/aggregate"), post(rerun_aggregate))
        .route(&format!("{prefix}/append"), post(deliver_append))
        .route(&format!("{prefix}/joins"), post(deliver_dispatch_joins))
        .route(&format!("{prefix}/join"), post(deliver_join))
        .route(&format!("{prefix}/aggregate"), post(deliver_aggregate))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn health() -> &'static str {
    "ok"
}

async fn start_run(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<StartRequest>,
) -> ApiResult<StartSummary> {
    Ok(Json(coordinator.start(request).await?))
}

async fn run_status(
    State(coordinator): State<Arc<Coordinator>>,
    Path(key): Path<String>,
) -> ApiResult<RunStatus> {
    let key = parse_key(&key)?;
    Ok(Json(coordinator.status(&key).await?))
}

async fn redispatch_joins(
    State(coordinator): State<Arc<Coordinator>>,
    Path(key): Path<String>,
) -> ApiResult<Handled> {
    let key = parse_key(&key)?;
    Ok(Json(coordinator.redispatch_joins(&key).await?))
}

async fn rerun_aggregate(
    State(coordinator): State<Arc<Coordinator>>,
    Path(key): Path<String>,
) -> ApiResult<Handled> {
    let key = parse_key(&key)?;
    Ok(Json(coordinator.rerun_aggregate(&key).await?))
}

async fn deliver_append(
    State(coordinator): State<Arc<Coordinator>>,
    Json(envelope): Json<TaskEnvelope>,
) -> ApiResult<Handled> {
    deliver(&coordinator, "append", &envelope).await
}

async fn deliver_dispatch_joins(
    State(coordinator): State<Arc<Coordinator>>,
    Json(envelope): Json<TaskEnvelope>,
) -> ApiResult<Handled> {
    deliver(&coordinator, "joins", &envelope).await
}

async fn deliver_join(
    State(coordinator): State<Arc<Coordinator>>,
    Json(envelope): Json<TaskEnvelope>,
) -> ApiResult<Handled> {
    deliver(&coordinator, "join", &envelope).await
}

async fn deliver_aggregate(
    State(coordinator): State<Arc<Coordinator>>,
    Json(envelope): Json<TaskEnvelope>,
) -> ApiResult<Handled> {
    deliver(&coordinator, "aggregate", &envelope).await
}

async fn deliver(coordinator: &Coordinator, kind: &str, envelope: &TaskEnvelope) -> ApiResult<Handled> {
    if envelope.task.kind() != kind {
        return Err(Error::invalid_request(format!(
            "{} task delivered to the {kind} route",
            envelope.task.kind()
        ))
        .into());
    }
    Ok(Json(coordinator.execute(envelope).await?))
}

fn parse_key(raw: &str) -> Result<RunKey, ApiError> {
    RunKey::from_str(raw).map_err(ApiError::from)
}
