use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Map, Value};

use genqueue_core::error::{CoreError, JobError};
use genqueue_core::types::JobId;
use genqueue_worker::QueueError;

/// Application-level error type for HTTP handlers.
///
/// Every variant renders as `{"success": false, "error", "code", ...}`
/// with the job id attached when the failure is about one job.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `genqueue_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A job-level error, e.g. a wait that ran out of budget.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The queue has shut down and no longer accepts submissions.
    #[error("Job queue is not accepting submissions")]
    NotAccepting,

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Core(core) => AppError::Core(core),
            QueueError::Job(job) => AppError::Job(job),
            QueueError::NotAccepting => AppError::NotAccepting,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Core(CoreError::Validation(errors.to_string()))
    }
}

impl AppError {
    /// The job this failure is about, if any.
    fn job_id(&self) -> Option<JobId> {
        match self {
            AppError::Job(JobError::WaitTimeout { job_id, .. }) => Some(*job_id),
            AppError::Job(JobError::JobNotFound(id)) => Some(*id),
            AppError::Core(CoreError::NotFound { entity, id }) if *entity == "Job" => Some(*id),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- JobError variants ---
            AppError::Job(job) => {
                let status = match job {
                    JobError::JobNotFound(_) => StatusCode::NOT_FOUND,
                    JobError::WaitTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
                    JobError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
                    JobError::ResourceUnavailable(_) | JobError::Busy => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    JobError::ParseFailure { .. }
                    | JobError::GenerationFailure(_)
                    | JobError::HandlerPanic(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, job.code(), job.to_string())
            }

            // --- HTTP-specific errors ---
            AppError::NotAccepting => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_ACCEPTING",
                self.to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(false));
        body.insert("error".into(), Value::String(message));
        body.insert("code".into(), json!(code));
        if let Some(job_id) = self.job_id() {
            body.insert("job_id".into(), json!(job_id));
        }

        (status, axum::Json(Value::Object(body))).into_response()
    }
}
