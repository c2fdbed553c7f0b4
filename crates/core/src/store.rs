//! Job persistence contract and the process-local implementation.
//!
//! The queue never owns job records. It asks a [`JobStore`] to create,
//! fetch, and advance them, and the store enforces the lifecycle rules via
//! [`Job::apply`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::job::{Job, JobUpdate, NewJob};
use crate::types::JobId;

/// Persistence collaborator consumed by the job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job and return its assigned id.
    async fn create_job(&self, new: NewJob) -> Result<JobId, CoreError>;

    /// Fetch a job. Returns [`CoreError::NotFound`] for unknown ids.
    async fn get_job(&self, id: JobId) -> Result<Job, CoreError>;

    /// Apply an update and return the job as stored afterwards.
    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job, CoreError>;
}

/// In-memory [`JobStore`] backed by a `HashMap`.
///
/// Ids start at 1 and increase monotonically for the lifetime of the store.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    next_id: AtomicI64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of jobs ever created.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<JobId, CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job::from_new(id, new, chrono::Utc::now());
        self.jobs.write().await.insert(id, job);
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, CoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound { entity: "Job", id })
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or(CoreError::NotFound { entity: "Job", id })?;
        job.apply(update)?;
        Ok(job.clone())
    }
}
