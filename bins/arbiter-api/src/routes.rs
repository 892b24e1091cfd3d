use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/problems", post(handlers::create_problem))
        .route("/problems/:id", get(handlers::get_problem))
        .route("/problems/:id/solution", put(handlers::replace_solution))
        .route("/problems/:id/submissions", post(handlers::create_submission))
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/jobs/:id", get(handlers::get_job_result))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
