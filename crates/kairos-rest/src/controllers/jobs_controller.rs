//! Job record REST API controller.

use super::require_registered;
use crate::responses::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use kairos_jobs::{JobId, JobRecord, JobState, JobStats};
use serde::{Deserialize, Serialize};

const MAX_PAGE_SIZE: usize = 500;

/// Create the jobs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Registered job type.
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default = "super::empty_payload")]
    pub payload: serde_json::Value,
    /// Run no earlier than this instant; omitted means now.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Response for a created job.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub state: JobState,
}

/// Query parameters for job listing.
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub state: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Response for job details.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub recurring_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id.to_string(),
            job_type: record.job_type,
            payload: record.payload,
            state: record.state,
            scheduled_at: record.scheduled_at,
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            last_error: record.last_error,
            recurring_id: record.recurring_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
        }
    }
}

/// Response for job listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub state: JobState,
    pub offset: usize,
    pub limit: usize,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::validation(format!("Invalid job id: {}", raw)))
}

// ============================================================================
// Handler Functions
// ============================================================================

/// Enqueue a job, or schedule it when `scheduled_at` is given.
async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    require_registered(&state.client, &request.job_type)?;

    let (job_id, job_state) = match request.scheduled_at {
        Some(at) => (
            state.client.schedule(&request.job_type, request.payload, at).await?,
            JobState::Scheduled,
        ),
        None => (
            state.client.enqueue(&request.job_type, request.payload).await?,
            JobState::Enqueued,
        ),
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job_id.to_string(),
            state: job_state,
        }),
    ))
}

/// Page of jobs in one state.
async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> ApiResult<Json<JobListResponse>> {
    let raw_state = params
        .state
        .ok_or_else(|| ApiError::validation("Query parameter 'state' is required"))?;
    let job_state: JobState = raw_state
        .parse()
        .map_err(|_| ApiError::validation(format!("Unknown job state: {}", raw_state)))?;
    let limit = params.limit.clamp(1, MAX_PAGE_SIZE);

    let jobs = state.client.list(job_state, params.offset, limit).await?;

    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
        state: job_state,
        offset: params.offset,
        limit,
    }))
}

/// Record counts per state.
async fn job_stats(State(state): State<AppState>) -> ApiResult<Json<JobStats>> {
    Ok(Json(state.client.stats().await?))
}

/// Get job by ID.
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let record = state.client.get(&job_id).await?;
    Ok(Json(record.into()))
}

/// Move a job to DELETED.
async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let record = state.client.delete(&job_id).await?;
    Ok(Json(record.into()))
}
