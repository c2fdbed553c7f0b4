//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// POST   /                -> submit_job
/// GET    /{id}            -> get_job
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(jobs::submit_job))
        .route("/{id}", get(jobs::get_job))
}

/// Wait route mounted at `/jobs`, outside the request timeout.
///
/// ```text
/// GET    /{id}/wait       -> wait_for_job
/// ```
pub fn wait_router() -> Router<AppState> {
    Router::new().route("/{id}/wait", get(jobs::wait_for_job))
}
