//! JSON control API over the scheduler.
//!
//! Any front end (web UI, scripts, another process) drives the queue through
//! these routes; the scheduler task stays the single source of truth.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::RenderQueueError;
use crate::estimator::{BatchEta, JobEstimate};
use crate::scheduler::{Job, MoveDirection, SchedulerHandle, SchedulerStatus};
use crate::store::LifetimeStats;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: SchedulerHandle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: String,
    pub attempts: u32,
    pub last_duration_secs: Option<f64>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.display_name(),
            path: job.path.display().to_string(),
            status: job.status.to_string(),
            attempts: job.attempts,
            last_duration_secs: job.last_duration.map(|d| d.as_secs_f64()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddJobRequest {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct MoveJobRequest {
    pub direction: MoveDirection,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartBatchResponse {
    pub started: bool,
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Failures returned to API clients as `{"error": message}`.
pub enum ApiError {
    /// Scheduler errors mapped onto HTTP statuses
    Scheduler(RenderQueueError),
    /// The request itself could not be extracted (bad id, malformed body)
    Rejected { status: StatusCode, message: String },
}

impl From<RenderQueueError> for ApiError {
    fn from(e: RenderQueueError) -> Self {
        Self::Scheduler(e)
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Scheduler(e) => {
                let status = match &e {
                    RenderQueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
                    RenderQueueError::InvariantViolation(_)
                    | RenderQueueError::DuplicateJob(_) => StatusCode::CONFLICT,
                    RenderQueueError::UnsupportedTarget(_)
                    | RenderQueueError::TargetMissing(_) => StatusCode::BAD_REQUEST,
                    RenderQueueError::SchedulerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::Rejected { status, message } => (status, message),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// `Path` extractor whose rejections use the JSON error body.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
struct ApiPath<T>(T);

/// `Json` extractor whose rejections use the JSON error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(add_job_handler))
        .route("/api/jobs/clear-done", post(clear_done_handler))
        .route("/api/jobs/reset-all", post(reset_all_handler))
        .route("/api/jobs/reload", post(reload_handler))
        .route("/api/jobs/{id}", delete(remove_job_handler).get(get_job_handler))
        .route("/api/jobs/{id}/reset", post(reset_job_handler))
        .route("/api/jobs/{id}/move", post(move_job_handler))
        .route("/api/jobs/{id}/estimate", get(estimate_handler))
        .route("/api/batch/start", post(start_batch_handler))
        .route("/api/batch/cancel", post(cancel_handler))
        .route("/api/settings/auto-retry", post(auto_retry_handler))
        .route("/api/settings/single-frame", post(single_frame_handler))
        .route("/api/eta", get(eta_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting control API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn list_jobs_handler(State(state): State<ApiState>) -> ApiResult<Vec<JobResponse>> {
    let jobs = state.scheduler.jobs().await?;
    Ok(Json(jobs.iter().map(JobResponse::from).collect()))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JobResponse> {
    let job = state.scheduler.job(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

async fn add_job_handler(
    State(state): State<ApiState>,
    ApiJson(payload): ApiJson<AddJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state.scheduler.add_job(payload.path).await?;
    Ok((StatusCode::CREATED, Json(JobResponse::from(&job))))
}

async fn remove_job_handler(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JobResponse> {
    let job = state.scheduler.remove_job(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

async fn reset_job_handler(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JobResponse> {
    let job = state.scheduler.reset_job(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

async fn move_job_handler(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<MoveJobRequest>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.move_job(id, payload.direction).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn estimate_handler(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<JobEstimate> {
    Ok(Json(state.scheduler.estimate(id).await?))
}

async fn clear_done_handler(State(state): State<ApiState>) -> ApiResult<CountResponse> {
    let count = state.scheduler.clear_done().await?;
    Ok(Json(CountResponse { count }))
}

async fn reset_all_handler(State(state): State<ApiState>) -> ApiResult<CountResponse> {
    let count = state.scheduler.reset_all().await?;
    Ok(Json(CountResponse { count }))
}

async fn reload_handler(State(state): State<ApiState>) -> ApiResult<CountResponse> {
    let count = state.scheduler.reload().await?;
    Ok(Json(CountResponse { count }))
}

async fn start_batch_handler(State(state): State<ApiState>) -> ApiResult<StartBatchResponse> {
    let job_id = state.scheduler.start_batch().await?;
    Ok(Json(StartBatchResponse {
        started: job_id.is_some(),
        job_id: job_id.map(|id| id.to_string()),
    }))
}

async fn cancel_handler(State(state): State<ApiState>) -> ApiResult<CancelResponse> {
    let cancelled = state.scheduler.cancel().await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn auto_retry_handler(
    State(state): State<ApiState>,
    ApiJson(payload): ApiJson<ToggleRequest>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.set_auto_retry(payload.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn single_frame_handler(
    State(state): State<ApiState>,
    ApiJson(payload): ApiJson<ToggleRequest>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.set_single_frame(payload.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn eta_handler(State(state): State<ApiState>) -> ApiResult<BatchEta> {
    Ok(Json(state.scheduler.eta().await?))
}

async fn stats_handler(State(state): State<ApiState>) -> ApiResult<LifetimeStats> {
    Ok(Json(state.scheduler.stats().await?))
}

async fn status_handler(State(state): State<ApiState>) -> ApiResult<SchedulerStatus> {
    Ok(Json(state.scheduler.status().await?))
}
