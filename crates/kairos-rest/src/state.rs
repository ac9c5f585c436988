//! Application state for Axum handlers.

use kairos_jobs::{JobClient, JobStorage};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub client: JobClient,
    pub storage: Arc<dyn JobStorage>,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(client: JobClient, storage: Arc<dyn JobStorage>) -> Self {
        Self { client, storage }
    }
}
