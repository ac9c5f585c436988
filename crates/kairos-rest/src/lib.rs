//! # Kairos REST
//!
//! HTTP front-end over [`kairos_jobs::JobClient`]: job status lookup,
//! enqueueing, recurring schedule registration and health checks.

pub mod controllers;
pub mod middleware;
pub mod responses;
pub mod router;
pub mod state;

pub use responses::{ApiError, ApiResult};
pub use router::*;
pub use state::*;
