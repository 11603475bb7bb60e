//! Axum router configuration with middleware.
//!
//! Management routes are under `/api/v1/`. The worker-side trigger endpoint
//! lives at `/workers/trigger` so remote dispatchers can target any host by
//! base URL.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflows
        .route("/workflows", get(handlers::workflow::list_workflows))
        .route("/workflows/{id}/start", post(handlers::workflow::start_workflow))
        // Instances
        .route("/instances", get(handlers::instance::list_instances))
        .route("/instances/{id}", get(handlers::instance::get_instance))
        .route("/instances/{id}/resume", post(handlers::instance::resume_instance))
        .route("/instances/{id}/cancel", post(handlers::instance::cancel_instance))
        .route("/instances/{id}/replay", get(handlers::instance::verify_replay))
        // Signals
        .route("/signals", post(handlers::signal::send_signal))
        .route("/signals/resume", post(handlers::signal::resume_by_token))
        // Jobs
        .route(
            "/jobs",
            get(handlers::job::list_jobs).post(handlers::job::dispatch_job),
        )
        .route("/jobs/{id}", get(handlers::job::get_job))
        .route("/callbacks/jobs", post(handlers::callback::receive_job_callback))
        .route("/workers", get(handlers::worker::list_workers))
        // Queues
        .route(
            "/queues",
            get(handlers::queue::list_queues).post(handlers::queue::register_queue),
        )
        .route("/queues/{id}/dispatch", post(handlers::queue::dispatch_queue))
        .route("/queue-jobs/{id}", get(handlers::queue::get_queue_job));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/workers/trigger", post(handlers::trigger::trigger_worker))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
