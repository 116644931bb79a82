//! HTTP surface: enqueue, poll, cancel.

use crate::error::StoreError;
use crate::progress::ProgressTracker;
use crate::store::{JobStore, QueueStats};
use crate::{default_dedup_key, ErrorKind, JobId, JobRequest, JobStatus, Priority, SubjectType};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::*;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub progress: Arc<ProgressTracker>,
    pub wake: Arc<Notify>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} not found")]
    UnknownJob(JobId),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::UnknownJob(_) | ApiError::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Store(StoreError::Invalid(_)) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Store(StoreError::InvalidState { .. }) => (StatusCode::CONFLICT, "invalid_state"),
            ApiError::Store(StoreError::NotOwner { .. }) => (StatusCode::CONFLICT, "not_owner"),
            ApiError::Store(StoreError::Unavailable(err)) => {
                error!(error = %err, "Job store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
        };
        let body = json!({
            "error": {
                "type": kind,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub subject_type: SubjectType,
    pub subject_ids: Vec<String>,
    pub priority: Priority,
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl From<EnqueueBody> for JobRequest {
    fn from(body: EnqueueBody) -> Self {
        let dedup_key = body
            .dedup_key
            .unwrap_or_else(|| default_dedup_key(body.subject_type, &body.subject_ids));
        JobRequest {
            dedup_key,
            subject_type: body.subject_type,
            subject_ids: body.subject_ids,
            priority: body.priority,
            max_attempts: body.max_attempts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub percent_complete: f32,
    pub current_item: Option<String>,
    pub message: String,
    pub eta_seconds: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: JobStatus,
    pub cancel_requested: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/analysis/jobs", post(enqueue_job))
        .route("/analysis/jobs/{job_id}", get(job_status).delete(cancel_job))
        .route("/analysis/stats", get(queue_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves on an already bound listener until `cancel_token` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel_token: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel_token.cancelled_owned())
        .await
}

pub async fn listen(
    addr: SocketAddr,
    state: AppState,
    cancel_token: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, cancel_token).await
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let request = JobRequest::from(body);
    let job_id = state.store.enqueue(request).await?;
    debug!(job_id = %job_id, "Job enqueued");
    state.wake.notify_one();
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .store
        .get(job_id)
        .await?
        .ok_or(ApiError::UnknownJob(job_id))?;
    let progress = state.progress.get_status(job_id).await?;

    let (percent_complete, current_item, message, eta_seconds) = match progress {
        Some(p) => (p.percent_complete, p.current_item, p.message, p.eta_seconds),
        None => (0.0, None, default_message(job.status), None),
    };
    let percent_complete = if job.status == JobStatus::Completed {
        100.0
    } else {
        percent_complete
    };

    Ok(Json(JobStatusResponse {
        job_id,
        status: job.status,
        attempt_count: job.attempt_count,
        max_attempts: job.max_attempts,
        percent_complete,
        current_item,
        message,
        eta_seconds,
        error_kind: job.error_kind,
        error_message: job.error_message,
    }))
}

fn default_message(status: JobStatus) -> String {
    match status {
        JobStatus::Queued => "Waiting to start",
        JobStatus::InProgress => "Analyzing",
        JobStatus::Completed => "Completed",
        JobStatus::Failed => "Failed",
        JobStatus::Cancelled => "Cancelled",
    }
    .to_string()
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<CancelResponse>, ApiError> {
    let status = state.store.cancel(job_id).await?;
    if status == JobStatus::Cancelled {
        state
            .progress
            .finish(job_id, JobStatus::Cancelled, "Cancelled before start")
            .await;
    }
    info!(job_id = %job_id, status = ?status, "Cancel requested");
    Ok(Json(CancelResponse {
        status,
        cancel_requested: status == JobStatus::InProgress,
    }))
}

async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}
