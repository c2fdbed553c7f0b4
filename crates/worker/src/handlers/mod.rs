//! Per-kind job handlers.
//!
//! Every [`JobKind`] maps to exactly one handler field on [`Handlers`], so
//! adding a kind without a handler fails to compile.

pub mod image;
pub mod text;
pub mod workflow;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use genqueue_core::error::{CoreError, JobError};
use genqueue_core::job::{Job, JobKind, JobStatus, JobUpdate, NewJob};
use genqueue_core::store::JobStore;
use genqueue_core::types::JobId;
use genqueue_events::{EventBus, JobEvent};

use crate::engine::{JobQueue, QueueError};

pub use image::ImageGenerationHandler;
pub use text::TextGenerationHandler;
pub use workflow::{Workflow, WorkflowHandler, WorkflowRegistry};

/// Executes jobs of one kind.
///
/// `Ok` completes the job with the returned result; `Err` fails it with the
/// error's message. Panics are caught by the lane worker.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError>;
}

/// One handler per job kind.
#[derive(Clone)]
pub struct Handlers {
    pub text: Arc<dyn JobHandler>,
    pub image: Arc<dyn JobHandler>,
    pub workflow: Arc<dyn JobHandler>,
}

impl Handlers {
    pub fn for_kind(&self, kind: JobKind) -> &Arc<dyn JobHandler> {
        match kind {
            JobKind::TextGeneration => &self.text,
            JobKind::ImageGeneration => &self.image,
            JobKind::Workflow => &self.workflow,
        }
    }
}

/// What a handler sees of the running job and the system around it.
pub struct JobContext {
    job: Job,
    events: Arc<EventBus>,
    store: Arc<dyn JobStore>,
    queue: JobQueue,
}

impl JobContext {
    pub(crate) fn new(
        job: Job,
        events: Arc<EventBus>,
        store: Arc<dyn JobStore>,
        queue: JobQueue,
    ) -> Self {
        Self {
            job,
            events,
            store,
            queue,
        }
    }

    /// The job as it was when processing started.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn emit(&self, event: &JobEvent) -> bool {
        self.events.emit(event)
    }

    /// Persist the current attempt number.
    pub async fn set_attempt(&self, attempt: u32) -> Result<(), JobError> {
        self.store
            .update_job(self.job.id, JobUpdate::attempt(attempt))
            .await
            .map(|_| ())
            .map_err(|e| {
                JobError::GenerationFailure(format!("Failed to record attempt {attempt}: {e}"))
            })
    }

    /// Run a child job on the same queue and wait for it to complete.
    ///
    /// A child that ends `failed` is reported as a generation failure.
    pub async fn submit_and_wait(&self, new: NewJob) -> Result<Job, JobError> {
        let kind = new.kind;
        let child = self
            .queue
            .submit_and_wait(new, None)
            .await
            .map_err(|e| match e {
                QueueError::Job(e) => e,
                QueueError::NotAccepting => {
                    JobError::ResourceUnavailable("Job queue is shutting down".into())
                }
                QueueError::Core(e) => JobError::GenerationFailure(e.to_string()),
            })?;

        tracing::debug!(job_id = self.job.id, child_id = child.id, kind = %kind, status = %child.status, "Child job finished");
        if child.status == JobStatus::Failed {
            return Err(JobError::GenerationFailure(format!(
                "Child {kind} job {} failed: {}",
                child.id,
                child.error.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(child)
    }
}

/// Payload decoding failures fail the job before any backend work.
pub(crate) fn invalid_payload(err: CoreError) -> JobError {
    match err {
        CoreError::Validation(msg) => JobError::InvalidPayload(msg),
        other => JobError::InvalidPayload(other.to_string()),
    }
}
