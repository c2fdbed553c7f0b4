//! Handlers for the `/jobs` resource.

use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use genqueue_core::error::CoreError;
use genqueue_core::job::{JobKind, NewJob};
use genqueue_core::types::JobId;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Longest wait a single request may ask for.
pub const MAX_WAIT_SECS: u64 = 3600;

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    pub kind: JobKind,
    pub payload: Value,
    #[serde(default)]
    #[validate(range(min = -1000, max = 1000))]
    pub priority: Option<i32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: Option<u32>,
}

impl SubmitJobRequest {
    fn into_new_job(self) -> NewJob {
        let mut new = NewJob::new(self.kind, self.payload);
        if let Some(priority) = self.priority {
            new = new.with_priority(priority);
        }
        if let Some(max_attempts) = self.max_attempts {
            new = new.with_max_attempts(max_attempts);
        }
        new
    }
}

#[derive(Debug, Serialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub kind: JobKind,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Enqueue a job and return 201 with its id. The job starts `pending`.
pub async fn submit_job(
    State(state): State<AppState>,
    input: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = input?;
    input.validate()?;
    if !input.payload.is_object() {
        return Err(AppError::Core(CoreError::Validation(
            "payload must be a JSON object".into(),
        )));
    }

    let kind = input.kind;
    let job_id = state.queue.submit(input.into_new_job()).await?;

    tracing::info!(job_id, kind = kind.as_str(), "Job submitted via API");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmittedJob { job_id, kind },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    id: Result<Path<JobId>, PathRejection>,
) -> AppResult<impl IntoResponse> {
    let Path(id) = id?;
    let job = state.queue.get(id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// GET /api/v1/jobs/{id}/wait?timeout_secs=
///
/// Block until the job is terminal. Without `timeout_secs` the budget is
/// the default for the job's kind. Running out of budget is a 408 and
/// leaves the job running.
pub async fn wait_for_job(
    State(state): State<AppState>,
    id: Result<Path<JobId>, PathRejection>,
    query: Result<Query<WaitQuery>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Path(id) = id?;
    let Query(query) = query?;

    let timeout = match query.timeout_secs {
        Some(secs) if secs > MAX_WAIT_SECS => {
            return Err(AppError::Core(CoreError::Validation(format!(
                "timeout_secs must be at most {MAX_WAIT_SECS}"
            ))));
        }
        Some(secs) => Duration::from_secs(secs),
        None => state.queue.get(id).await?.kind.default_wait_timeout(),
    };

    tracing::debug!(job_id = id, timeout_secs = timeout.as_secs(), "Waiting for job");
    let job = state.queue.wait_for(id, timeout).await?;
    Ok(Json(DataResponse { data: job }))
}
