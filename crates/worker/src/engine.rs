//! The job queue engine.
//!
//! One [`JobQueue`] serves every job kind. Each lane is a single tokio task
//! popping from its own priority queue, so jobs in a lane run strictly one
//! at a time. Accelerator-bound handlers additionally hold a lease from the
//! [`ResourceArbiter`] while they run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use genqueue_core::error::{CoreError, JobError};
use genqueue_core::job::{Job, JobKind, JobStatus, JobUpdate, NewJob};
use genqueue_core::store::JobStore;
use genqueue_core::types::JobId;
use genqueue_events::bus::panic_message;
use genqueue_events::{EventBus, JobEvent};

use crate::arbiter::ResourceArbiter;
use crate::config::{validate_lanes, LaneConfig, QueueConfig};
use crate::handlers::{Handlers, JobContext};
use crate::queue::PriorityQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Job queue is not accepting submissions")]
    NotAccepting,
}

/// Collaborators the queue is built from.
pub struct QueueDeps {
    pub store: Arc<dyn JobStore>,
    pub events: Arc<EventBus>,
    pub arbiter: Arc<ResourceArbiter>,
    pub handlers: Handlers,
}

struct Lane {
    config: LaneConfig,
    queue: PriorityQueue,
    /// Job the lane worker is running, if any.
    in_flight: Mutex<Option<JobId>>,
}

impl Lane {
    fn set_in_flight(&self, id: Option<JobId>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn in_flight(&self) -> Option<JobId> {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    events: Arc<EventBus>,
    arbiter: Arc<ResourceArbiter>,
    handlers: Handlers,
    config: QueueConfig,
    lanes: Vec<Lane>,
    routes: HashMap<JobKind, usize>,
    waiters: Mutex<HashMap<JobId, Vec<oneshot::Sender<Job>>>>,
    accepting: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(usize, JoinHandle<()>)>>,
}

/// Handle to the job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Build a queue. Lanes do not run until [`JobQueue::start`].
    pub fn new(deps: QueueDeps, config: QueueConfig) -> Result<Self, QueueError> {
        let lane_configs = config.lanes();
        validate_lanes(&lane_configs)?;

        let mut routes = HashMap::new();
        for (index, lane) in lane_configs.iter().enumerate() {
            for kind in &lane.kinds {
                routes.insert(*kind, index);
            }
        }
        let lanes = lane_configs
            .into_iter()
            .map(|config| Lane {
                config,
                queue: PriorityQueue::new(),
                in_flight: Mutex::new(None),
            })
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                store: deps.store,
                events: deps.events,
                arbiter: deps.arbiter,
                handlers: deps.handlers,
                config,
                lanes,
                routes,
                waiters: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn one worker task per lane. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (index, lane) in self.inner.lanes.iter().enumerate() {
            let queue = self.clone();
            let cancel = self.inner.cancel.child_token();
            let handle = tokio::spawn(async move { queue.run_lane(index, cancel).await });
            tasks.push((index, handle));
        }
    }

    /// Stop accepting jobs, stop every lane, and wait for them to exit.
    ///
    /// A job already running gets up to the lane shutdown timeout to
    /// finish. A lane that overruns it is aborted and its running job is
    /// marked `failed` with "Interrupted by shutdown". Jobs still queued
    /// stay `pending`.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let timeout = self.inner.config.lane_shutdown_timeout;
        for (index, mut handle) in tasks {
            let lane = &self.inner.lanes[index];
            let name = lane.config.name.as_str();
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(lane = name, error = %e, "Lane worker ended abnormally"),
                Err(_) => {
                    tracing::warn!(lane = name, timeout_ms = timeout.as_millis() as u64, "Lane worker did not stop in time, aborting");
                    handle.abort();
                    // Wait for the abort to land so the job cannot finish behind us.
                    let _ = handle.await;
                    if let Some(id) = lane.in_flight() {
                        self.fail_interrupted(name, id).await;
                    }
                }
            }
        }

        // Dropping the senders wakes any remaining waiters.
        self.waiters().clear();
        tracing::info!("Job queue shut down");
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Persist a job and enqueue it on its kind's lane.
    pub async fn submit(&self, mut new: NewJob) -> Result<JobId, QueueError> {
        if !self.is_accepting() {
            return Err(QueueError::NotAccepting);
        }
        let lane_index = self.lane_for(new.kind)?;
        new.max_attempts
            .get_or_insert(self.inner.config.max_attempts_for(new.kind));

        let (kind, priority) = (new.kind, new.priority);
        let id = self.inner.store.create_job(new).await?;

        self.inner.events.emit(&JobEvent::Queued {
            job_id: id,
            kind,
            priority,
        });
        let lane = &self.inner.lanes[lane_index];
        lane.queue.push(id, priority);
        tracing::info!(job_id = id, kind = %kind, priority, lane = %lane.config.name, "Job queued");
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> Result<Job, QueueError> {
        self.inner.store.get_job(id).await.map_err(|e| match e {
            CoreError::NotFound { .. } => QueueError::Job(JobError::JobNotFound(id)),
            other => QueueError::Core(other),
        })
    }

    /// Wait until a job reaches a terminal status.
    ///
    /// On timeout the job keeps running; only the wait is abandoned.
    pub async fn wait_for(&self, id: JobId, timeout: Duration) -> Result<Job, QueueError> {
        let (tx, rx) = oneshot::channel();
        // Register before reading the store so a completion in between is not lost.
        self.waiters().entry(id).or_default().push(tx);

        let job = match self.get(id).await {
            Ok(job) => job,
            Err(e) => {
                self.waiters().remove(&id);
                return Err(e);
            }
        };
        if job.is_terminal() {
            self.waiters().remove(&id);
            return Ok(job);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(_)) => Err(JobError::ResourceUnavailable(format!(
                "Job {id} will not report an outcome"
            ))
            .into()),
            Err(_) => {
                self.prune_waiters(id);
                tracing::debug!(job_id = id, waited_ms = timeout.as_millis() as u64, "Wait timed out");
                Err(JobError::WaitTimeout {
                    job_id: id,
                    waited: timeout,
                }
                .into())
            }
        }
    }

    /// Submit a job and wait for its outcome. `None` uses the kind's
    /// default wait budget.
    pub async fn submit_and_wait(
        &self,
        new: NewJob,
        timeout: Option<Duration>,
    ) -> Result<Job, QueueError> {
        let timeout = timeout.unwrap_or_else(|| new.kind.default_wait_timeout());
        let id = self.submit(new).await?;
        self.wait_for(id, timeout).await
    }

    /// Jobs queued across all lanes, excluding running ones.
    pub fn queue_depth(&self) -> usize {
        self.inner.lanes.iter().map(|l| l.queue.len()).sum()
    }

    /// Queued jobs per lane name.
    pub fn lane_depths(&self) -> Vec<(String, usize)> {
        self.inner
            .lanes
            .iter()
            .map(|l| (l.config.name.clone(), l.queue.len()))
            .collect()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    fn lane_for(&self, kind: JobKind) -> Result<usize, QueueError> {
        self.inner.routes.get(&kind).copied().ok_or_else(|| {
            QueueError::Core(CoreError::Internal(format!("No lane serves {kind}")))
        })
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Vec<oneshot::Sender<Job>>>> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn prune_waiters(&self, id: JobId) {
        let mut waiters = self.waiters();
        if let Some(senders) = waiters.get_mut(&id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                waiters.remove(&id);
            }
        }
    }

    fn notify_waiters(&self, job: &Job) {
        let senders = self.waiters().remove(&job.id).unwrap_or_default();
        for tx in senders {
            // The waiter may have timed out already.
            let _ = tx.send(job.clone());
        }
    }

    /// Record a job whose lane was aborted mid-run as failed.
    async fn fail_interrupted(&self, lane: &str, id: JobId) {
        let inner = &self.inner;
        let job = match inner.store.get_job(id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = id, lane, error = %e, "Failed to load interrupted job");
                return;
            }
        };
        if job.status != JobStatus::Processing {
            return;
        }

        let completed_at = chrono::Utc::now();
        let duration_ms = job
            .started_at
            .map(|started| (completed_at - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let error = "Interrupted by shutdown".to_string();
        match inner
            .store
            .update_job(id, JobUpdate::failed(error.clone(), completed_at))
            .await
        {
            Ok(job) => {
                tracing::warn!(job_id = id, kind = %job.kind, lane, duration_ms, "Job interrupted by shutdown");
                inner.events.emit(&JobEvent::Failed {
                    job_id: id,
                    kind: job.kind,
                    error,
                    duration_ms,
                });
                self.notify_waiters(&job);
            }
            Err(e) => {
                tracing::error!(job_id = id, lane, error = %e, "Failed to record interrupted job");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lane worker
    // -----------------------------------------------------------------------

    async fn run_lane(self, index: usize, cancel: CancellationToken) {
        let lane = &self.inner.lanes[index];
        let name = lane.config.name.as_str();
        tracing::info!(
            lane = name,
            kinds = ?lane.config.kinds,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "Lane worker started",
        );

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = lane.queue.pop_timeout(self.inner.config.poll_interval) => next,
            };
            if let Some(id) = next {
                lane.set_in_flight(Some(id));
                self.process(name, id).await;
                lane.set_in_flight(None);
            }
        }

        tracing::info!(lane = name, "Lane worker stopped");
    }

    /// Run one job to a terminal status. Never panics and never returns an
    /// error: every failure ends as a `failed` job or a log line.
    async fn process(&self, lane: &str, id: JobId) {
        let inner = &self.inner;

        let job = match inner.store.get_job(id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = id, lane, error = %e, "Failed to load dequeued job");
                return;
            }
        };
        if job.status != JobStatus::Pending {
            tracing::warn!(job_id = id, lane, status = %job.status, "Dequeued job is no longer pending, skipping");
            return;
        }

        let started_at = chrono::Utc::now();
        let job = match inner
            .store
            .update_job(id, JobUpdate::processing(started_at))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = id, lane, error = %e, "Failed to mark job processing");
                return;
            }
        };
        let kind = job.kind;
        inner.events.emit(&JobEvent::Started {
            job_id: id,
            kind,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
        });
        tracing::info!(job_id = id, kind = %kind, lane, attempt = job.attempt, "Job started");

        let lease = inner.arbiter.acquire_for(kind).await;
        let ctx = JobContext::new(
            job,
            Arc::clone(&inner.events),
            Arc::clone(&inner.store),
            self.clone(),
        );
        let handler = Arc::clone(inner.handlers.for_kind(kind));
        let outcome = AssertUnwindSafe(handler.handle(&ctx)).catch_unwind().await;
        drop(lease);

        let outcome = outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(job_id = id, kind = %kind, lane, panic = %message, "Job handler panicked");
            Err(JobError::HandlerPanic(message))
        });

        let completed_at = chrono::Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let (update, event) = match outcome {
            Ok(result) => {
                tracing::info!(job_id = id, kind = %kind, lane, duration_ms, "Job completed");
                (
                    JobUpdate::completed(result.clone(), completed_at),
                    JobEvent::Completed {
                        job_id: id,
                        kind,
                        result,
                        duration_ms,
                    },
                )
            }
            Err(e) => {
                tracing::error!(job_id = id, kind = %kind, lane, code = e.code(), error = %e, "Job failed");
                let error = e.to_string();
                (
                    JobUpdate::failed(error.clone(), completed_at),
                    JobEvent::Failed {
                        job_id: id,
                        kind,
                        error,
                        duration_ms,
                    },
                )
            }
        };

        match inner.store.update_job(id, update).await {
            Ok(job) => {
                inner.events.emit(&event);
                self.notify_waiters(&job);
            }
            Err(e) => {
                tracing::error!(job_id = id, lane, error = %e, "Failed to record job outcome");
                self.waiters().remove(&id);
            }
        }
    }
}
