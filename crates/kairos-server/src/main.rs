//! # Kairos Server
//!
//! Runs the job server (scheduler loop and worker pool) next to the HTTP
//! API and the demo endpoints, sharing one storage backend.

use kairos_config::{AppConfig, ConfigLoader};
use kairos_core::{init_tracing, KairosError, KairosResult};
use kairos_jobs::{register_metrics, storage, JobServer, JobServerConfig};
use kairos_rest::{create_router_with, AppState};
use kairos_server::{demo_controller, demo_jobs, startup};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location() {
        Ok(loader) => loader.get().await,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> KairosResult<()> {
    startup::print_banner();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    register_metrics();

    let storage = storage::connect(&config.storage).await?;

    let registry = startup::build_registry(&config);
    demo_jobs::register_demo_jobs(&registry)?;

    let job_server = JobServer::new(storage.clone(), Arc::new(registry), JobServerConfig::from(&config));
    job_server.start().await?;

    let state = AppState::new(job_server.client().clone(), storage.clone());
    let router = create_router_with(state, &config.server, demo_controller::router());

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| KairosError::Server(format!("Failed to bind {}: {}", addr, e)))?;

    startup::print_startup_info(&addr, storage.backend_name());

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| KairosError::Server(format!("HTTP server error: {}", e)));

    // Stop claiming new work before exiting, even if the HTTP server failed.
    job_server.shutdown().await;
    served?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
