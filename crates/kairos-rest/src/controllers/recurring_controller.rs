//! Recurring schedule REST API controller.

use super::require_registered;
use crate::responses::ApiResult;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use kairos_jobs::{JobState, RecurringSchedule};
use serde::{Deserialize, Serialize};

use super::jobs_controller::CreateJobResponse;

/// Create the recurring schedules router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/recurring", get(list_recurring))
        .route(
            "/recurring/:id",
            get(get_recurring).put(upsert_recurring).delete(delete_recurring),
        )
        .route("/recurring/:id/trigger", post(trigger_recurring))
}

/// Body of `PUT /recurring/:id`.
#[derive(Debug, Deserialize)]
pub struct UpsertRecurringRequest {
    /// 5, 6 or 7 field cron expression.
    pub cron: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default = "super::empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub allow_overlap: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecurringResponse {
    pub id: String,
    pub cron: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub next_fire_at: DateTime<Utc>,
    pub allow_overlap: bool,
    pub last_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RecurringSchedule> for RecurringResponse {
    fn from(schedule: RecurringSchedule) -> Self {
        Self {
            id: schedule.id,
            cron: schedule.cron_expression,
            job_type: schedule.job_type,
            payload: schedule.payload_template,
            next_fire_at: schedule.next_fire_at,
            allow_overlap: schedule.allow_overlap,
            last_job_id: schedule.last_job_id.map(|id| id.to_string()),
            created_at: schedule.created_at,
            updated_at: schedule.updated_at,
        }
    }
}

async fn list_recurring(State(state): State<AppState>) -> ApiResult<Json<Vec<RecurringResponse>>> {
    let schedules = state.client.list_recurring().await?;
    Ok(Json(schedules.into_iter().map(RecurringResponse::from).collect()))
}

async fn get_recurring(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RecurringResponse>> {
    Ok(Json(state.client.get_recurring(&id).await?.into()))
}

/// Idempotent create-or-update keyed by the path id.
async fn upsert_recurring(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpsertRecurringRequest>,
) -> ApiResult<Json<RecurringResponse>> {
    require_registered(&state.client, &request.job_type)?;

    let registration =
        RecurringSchedule::new(id, &request.cron, request.job_type, request.payload, Utc::now())?
            .with_allow_overlap(request.allow_overlap);
    let schedule = state.client.upsert_recurring(registration).await?;

    Ok(Json(schedule.into()))
}

async fn delete_recurring(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.client.delete_recurring(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Enqueue one instance now; the schedule's next window is unchanged.
/// Conflicts while the previous instance is unfinished, unless overlap is allowed.
async fn trigger_recurring(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let job_id = state.client.trigger_recurring(&id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job_id.to_string(),
            state: JobState::Enqueued,
        }),
    ))
}
