//! JSON API over the scheduler.

pub mod error;
pub mod routes;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::queue::JobScheduler;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: JobScheduler,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(scheduler: JobScheduler) -> Self {
        let config = scheduler.pipeline().config.clone();
        Self { scheduler, config }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/submit", post(routes::submit))
        .route("/api/submit_with_file", post(routes::submit_with_file))
        .route("/api/status/{id}", get(routes::job_status))
        .route("/api/jobs", get(routes::list_jobs))
        .route("/api/jobs/cancel/{id}", post(routes::cancel_job))
        .route("/api/download/{id}/{resolution}", get(routes::download))
        .route("/api/stream/{id}/{resolution}", get(routes::stream))
        .route("/api/files/browse", get(routes::browse_files))
        .route("/api/files/download/{*path}", get(routes::download_file))
        .route("/api/system/status", get(routes::system_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<(), AppError> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
