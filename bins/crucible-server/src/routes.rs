use crate::handlers;
use crate::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/submit", post(handlers::submit_job))
        .route("/api/job/:id", get(handlers::get_job))
        .route("/api/jobs", get(handlers::list_jobs))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(handlers::MAX_BODY_BYTES))
}
