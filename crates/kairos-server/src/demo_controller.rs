//! Demo endpoints that enqueue one job of each demo type.

use crate::demo_jobs::{DelayedJob, FailOnceThenSuccessJob, FailingJob, FireAndForgetJob, SlowJob};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use kairos_rest::{ApiResult, AppState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Creates the demo router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(home))
        .route("/jobs/cases", get(cases))
        .route("/jobs/enqueue", post(enqueue))
        .route("/jobs/delayed", post(delayed))
        .route("/jobs/slow", post(slow))
        .route("/jobs/fail", post(fail))
        .route("/jobs/fail-once", post(fail_once))
}

/// Service information.
#[derive(Debug, Serialize, Deserialize)]
pub struct HomeResponse {
    pub service: String,
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub cases: String,
}

/// Response for a demo job.
#[derive(Debug, Serialize, Deserialize)]
pub struct DemoJobResponse {
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
}

impl DemoJobResponse {
    fn new(job_id: impl ToString, kind: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            scheduled_at: None,
            correlation_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueParams {
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DelayedParams {
    #[serde(rename = "delaySeconds", default = "default_delay_seconds")]
    pub delay_seconds: u32,
}

fn default_delay_seconds() -> u32 {
    10
}

async fn home() -> Json<HomeResponse> {
    Json(HomeResponse {
        service: "kairos".to_string(),
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        cases: "GET /jobs/cases".to_string(),
    })
}

async fn cases() -> Json<BTreeMap<&'static str, &'static str>> {
    Json(BTreeMap::from([
        ("enqueue", "POST /jobs/enqueue?source=api"),
        ("delayed", "POST /jobs/delayed?delaySeconds=15"),
        ("slow", "POST /jobs/slow"),
        ("alwaysFail", "POST /jobs/fail"),
        ("failOnceThenSucceed", "POST /jobs/fail-once"),
    ]))
}

async fn enqueue(
    State(state): State<AppState>,
    Query(params): Query<EnqueueParams>,
) -> ApiResult<Json<DemoJobResponse>> {
    let job_id = state
        .client
        .enqueue_job(&FireAndForgetJob {
            source: params.source,
        })
        .await?;
    Ok(Json(DemoJobResponse::new(job_id, "fire-and-forget")))
}

async fn delayed(
    State(state): State<AppState>,
    Query(params): Query<DelayedParams>,
) -> ApiResult<Json<DemoJobResponse>> {
    let scheduled_at = Utc::now() + chrono::Duration::seconds(i64::from(params.delay_seconds));
    let job = DelayedJob {
        payload: format!("delaySeconds={}", params.delay_seconds),
    };
    let job_id = state.client.schedule_job(&job, scheduled_at).await?;

    let mut response = DemoJobResponse::new(job_id, "delayed");
    response.scheduled_at = Some(scheduled_at);
    Ok(Json(response))
}

async fn slow(State(state): State<AppState>) -> ApiResult<Json<DemoJobResponse>> {
    let job_id = state
        .client
        .enqueue_job(&SlowJob {
            payload: "slow-from-api".to_string(),
        })
        .await?;
    Ok(Json(DemoJobResponse::new(job_id, "slow")))
}

async fn fail(State(state): State<AppState>) -> ApiResult<Json<DemoJobResponse>> {
    let job_id = state
        .client
        .enqueue_job(&FailingJob {
            payload: "fail-from-api".to_string(),
        })
        .await?;
    Ok(Json(DemoJobResponse::new(job_id, "failing")))
}

async fn fail_once(State(state): State<AppState>) -> ApiResult<Json<DemoJobResponse>> {
    let key = Uuid::new_v4().to_string();
    let job_id = state
        .client
        .enqueue_job(&FailOnceThenSuccessJob {
            correlation_key: key.clone(),
        })
        .await?;

    let mut response = DemoJobResponse::new(job_id, "fail-once-then-success");
    response.correlation_key = Some(key);
    Ok(Json(response))
}
