//! REST API controllers.

pub mod health_controller;
pub mod jobs_controller;
pub mod recurring_controller;

use crate::responses::ApiError;
use kairos_jobs::JobClient;

/// Rejects job types with no registered handler.
pub(crate) fn require_registered(client: &JobClient, job_type: &str) -> Result<(), ApiError> {
    if client.registry().contains(job_type) {
        Ok(())
    } else {
        Err(ApiError::validation(format!("Unknown job type: {}", job_type)))
    }
}

/// Default payload when a request omits one.
pub(crate) fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
