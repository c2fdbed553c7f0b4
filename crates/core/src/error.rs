use std::time::Duration;

use crate::types::{DbId, JobId};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy for job execution and for callers waiting on jobs.
///
/// Handler-level variants never escape a lane worker: they are converted
/// into a terminal `failed` status plus a published failure event. Only
/// [`JobError::WaitTimeout`] and [`JobError::JobNotFound`] reach callers
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// A backend is not loaded or not reachable.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The non-blocking generation guard is already held.
    #[error("Generation backend is busy")]
    Busy,

    /// Generated output could not be parsed into structured data.
    #[error("Parse failure on attempt {attempt}: {reason}")]
    ParseFailure { attempt: u32, reason: String },

    /// The backend call itself failed or timed out. Not retried within a job.
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    /// The caller's wait budget ran out. The job keeps running.
    #[error("Timed out after {waited:?} waiting for job {job_id}")]
    WaitTimeout { job_id: JobId, waited: Duration },

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A handler panicked and was caught at the lane boundary.
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// The payload does not decode for the job's kind, or names an
    /// unknown parser, template, or workflow. Fails before generating.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl JobError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::ResourceUnavailable(_) => "RESOURCE_UNAVAILABLE",
            JobError::Busy => "BUSY",
            JobError::ParseFailure { .. } => "PARSE_FAILURE",
            JobError::GenerationFailure(_) => "GENERATION_FAILURE",
            JobError::WaitTimeout { .. } => "WAIT_TIMEOUT",
            JobError::JobNotFound(_) => "JOB_NOT_FOUND",
            JobError::HandlerPanic(_) => "HANDLER_PANIC",
            JobError::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }
}
