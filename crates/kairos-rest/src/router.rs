//! Main application router.

use crate::{
    controllers::{health_controller, jobs_controller, recurring_controller},
    middleware::logging_middleware,
    state::AppState,
};
use axum::{http::HeaderValue, middleware, Router};
use kairos_config::ServerConfig;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Creates the API router.
pub fn create_router(state: AppState, server_config: &ServerConfig) -> Router {
    create_router_with(state, server_config, Router::new())
}

/// Creates the API router with `extra` routes sharing its state and layers.
pub fn create_router_with(
    state: AppState,
    server_config: &ServerConfig,
    extra: Router<AppState>,
) -> Router {
    let cors = create_cors_layer(server_config);

    let api_router = Router::new()
        .merge(jobs_controller::router())
        .merge(recurring_controller::router());

    let router = Router::new()
        .merge(health_controller::router())
        .nest("/api/v1", api_router)
        .merge(extra)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware));

    info!("Router created with job and recurring schedule endpoints under /api/v1");
    router
}

/// Creates a CORS layer based on server configuration.
fn create_cors_layer(server_config: &ServerConfig) -> CorsLayer {
    if !server_config.cors_enabled {
        return CorsLayer::new();
    }

    if server_config.cors_origins.iter().any(|origin| origin == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = server_config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
