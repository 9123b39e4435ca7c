//! Router configuration for the web server.

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::handlers;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/queue", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/:state", get(handlers::list_jobs))
        .route("/stats", get(handlers::stats))
        .route(
            "/job/:id",
            get(handlers::get_job).delete(handlers::remove_job),
        )
        .route("/job/:id/retry", post(handlers::retry_job))
        .route("/pause", post(handlers::pause))
        .route("/resume", post(handlers::resume))
        .route("/clean", post(handlers::clean))
}
