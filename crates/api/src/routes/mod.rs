pub mod events;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` routes that complete within the request timeout.
///
/// ```text
/// /jobs                 submit (POST)
/// /jobs/{id}            get job (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/jobs", jobs::router())
}

/// Build the `/api/v1` routes that hold the request open.
///
/// ```text
/// /jobs/{id}/wait       block until terminal (GET, ?timeout_secs=)
/// /events/stream        event stream (GET)
/// ```
pub fn long_lived_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::wait_router())
        .nest("/events", events::router())
}
