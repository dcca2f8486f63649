//! Status HTTP server.
//!
//! Read-only queue visibility plus the three operator controls: enqueue a
//! disc detection missed, cancel a job, retry a failed one. Everything goes
//! through the scheduler's command channel; the server holds no job state.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::jobs::JobStage;
use crate::scheduler::{Command, JobSnapshot, SchedulerError, SchedulerHandle};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// An API failure, rendered as a JSON body with a matching status code.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl ApiError {
    fn unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "scheduler is not running".to_string(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::UnknownJob(_) => StatusCode::NOT_FOUND,
            SchedulerError::NotCancellable(_) | SchedulerError::NotFailed(_) => {
                StatusCode::CONFLICT
            }
            SchedulerError::Store(crate::jobs::StoreError::DuplicateDisc { .. }) => {
                StatusCode::CONFLICT
            }
            SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// Send a command and wait for its reply. A closed channel in either
/// direction means the scheduler is gone.
async fn roundtrip<T>(
    handle: &SchedulerHandle,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, ApiError> {
    let (tx, rx) = oneshot::channel();
    handle
        .commands
        .send(make(tx))
        .await
        .map_err(|_| ApiError::unavailable())?;
    rx.await.map_err(|_| ApiError::unavailable())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    stage: Option<JobStage>,
}

/// Handler for GET /jobs
/// Returns job snapshots, optionally filtered by ?stage=
async fn list_jobs(
    State(handle): State<SchedulerHandle>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobSnapshot>>, ApiError> {
    let jobs = roundtrip(&handle, |reply| Command::List {
        stage: query.stage,
        reply,
    })
    .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    device: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnqueueResponse {
    id: String,
}

/// Handler for POST /jobs
/// Enqueues a disc the event transport missed.
async fn enqueue_job(
    State(handle): State<SchedulerHandle>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let id = roundtrip(&handle, |reply| Command::Enqueue {
        device: request.device,
        reply,
    })
    .await??;
    Ok((StatusCode::CREATED, Json(EnqueueResponse { id })))
}

/// Handler for POST /jobs/:id/cancel
async fn cancel_job(
    State(handle): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    roundtrip(&handle, |reply| Command::Cancel { job_id, reply }).await??;
    Ok(StatusCode::ACCEPTED)
}

/// Handler for POST /jobs/:id/retry
async fn retry_job(
    State(handle): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    roundtrip(&handle, |reply| Command::Retry { job_id, reply }).await??;
    Ok(StatusCode::ACCEPTED)
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(handle: SchedulerHandle) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/retry", post(retry_job))
        .with_state(handle)
}

/// Runs the status HTTP server on 127.0.0.1:7979
pub async fn run_status_server(handle: SchedulerHandle) -> Result<(), ServerError> {
    let app = create_status_router(handle);
    let addr = SocketAddr::from(([127, 0, 0, 1], 7979));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Status server listening");
    axum::serve(listener, app).await.map_err(ServerError::Serve)?;

    Ok(())
}
