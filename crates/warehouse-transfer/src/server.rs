//! HTTP API over [`TransferService`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/pipeline` | Submit a transfer job |
//! | `GET` | `/api/status/{job_id}` | Job status and per-table progress |
//! | `POST` | `/api/sources` | Register reusable source credentials |
//! | `POST` | `/api/jobs/{job_id}/cancel` | Cancel a running job |
//! | `GET` | `/health` | Liveness probe |

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::credentials::{CredentialMap, WarehouseKind};
use crate::error::{ErrorCategory, TransferError};
use crate::service::{SubmitJobRequest, TransferService};

/// Application state shared across all handlers.
pub type AppState = Arc<TransferService>;

/// Build the API router.
pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/api/pipeline", post(submit_pipeline))
        .route("/api/status/{job_id}", get(job_status))
        .route("/api/sources", post(register_source))
        .route("/api/jobs/{job_id}/cancel", post(cancel_job))
        .route("/health", get(health))
        .with_state(service)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
    status: String,
    message: &'static str,
}

#[derive(Deserialize)]
struct RegisterSourceRequest {
    organization: String,
    kind: WarehouseKind,
    credentials: CredentialMap,
}

#[derive(Debug, Serialize)]
struct RegisterSourceResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    job_id: String,
    cancelled: bool,
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps library errors onto HTTP statuses.
struct ApiError(TransferError);

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(TransferError::Config(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::DuplicateJob(_) => StatusCode::CONFLICT,
            err if err.category() == ErrorCategory::Configuration => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// `POST /api/pipeline`: submit a transfer job.
async fn submit_pipeline(
    State(service): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let handle = service.submit_job(request).await?;
    let status = handle.query_status().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: handle.job_id().to_string(),
            status,
            message: "Pipeline execution started",
        }),
    ))
}

/// `GET /api/status/{job_id}`
async fn job_status(
    State(service): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(service.job_status(&job_id).await?))
}

/// `POST /api/sources`
async fn register_source(
    State(service): State<AppState>,
    payload: Result<Json<RegisterSourceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let id = service
        .register_source(&request.organization, request.kind, request.credentials)
        .await?;
    Ok((StatusCode::CREATED, Json(RegisterSourceResponse { id })))
}

/// `POST /api/jobs/{job_id}/cancel`
async fn cancel_job(
    State(service): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = service.cancel_job(&job_id).await?;
    Ok(Json(CancelResponse { job_id, cancelled }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
