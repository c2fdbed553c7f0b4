//! Job records and their status lifecycle.
//!
//! A [`Job`] has an immutable identity (id, kind, priority, payload) and a
//! mutable execution state that only moves forward:
//! `pending -> processing -> completed | failed`. All mutation goes
//! through [`Job::apply`], so every [`crate::store::JobStore`]
//! implementation enforces the same transition rules.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Priority assigned when the submitter does not pick one. Lower is served first.
pub const DEFAULT_PRIORITY: i32 = 0;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// Closed set of job kinds. Each kind has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TextGeneration,
    ImageGeneration,
    Workflow,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::TextGeneration,
        JobKind::ImageGeneration,
        JobKind::Workflow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::TextGeneration => "text_generation",
            JobKind::ImageGeneration => "image_generation",
            JobKind::Workflow => "workflow",
        }
    }

    /// Namespace used for this kind's lifecycle event names
    /// (`generation.started`, `image.failed`, ...).
    pub fn event_prefix(self) -> &'static str {
        match self {
            JobKind::TextGeneration => "generation",
            JobKind::ImageGeneration => "image",
            JobKind::Workflow => "workflow",
        }
    }

    /// Attempt budget used when the submitter does not set one.
    ///
    /// For image jobs this governs caller resubmission, not an internal loop.
    pub fn default_max_attempts(self) -> u32 {
        match self {
            JobKind::TextGeneration => 3,
            JobKind::ImageGeneration => 1,
            JobKind::Workflow => 1,
        }
    }

    /// How long a synchronous caller waits for a terminal status by default.
    pub fn default_wait_timeout(self) -> Duration {
        match self {
            JobKind::TextGeneration => Duration::from_secs(600),
            JobKind::ImageGeneration => Duration::from_secs(300),
            JobKind::Workflow => Duration::from_secs(1800),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Status only moves forward one step at a time; no regression, no skipping.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Lower is served first.
    pub priority: i32,
    /// Opaque to the queue; interpreted by the kind's handler.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Starts at 1. Only the text pipeline increments it.
    pub attempt: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Build the initial `pending` record for a submission.
    pub fn from_new(id: JobId, new: NewJob, created_at: Timestamp) -> Self {
        let max_attempts = new
            .max_attempts
            .unwrap_or_else(|| new.kind.default_max_attempts())
            .max(1);
        Self {
            id,
            kind: new.kind,
            priority: new.priority,
            payload: new.payload,
            status: JobStatus::Pending,
            attempt: 1,
            max_attempts,
            result: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock processing time, once the job has both started and finished.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }

    /// Apply an update, enforcing the lifecycle rules.
    ///
    /// The update is validated as a whole before anything is written, so a
    /// rejected update leaves the job untouched.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), CoreError> {
        let next_status = update.status.unwrap_or(self.status);

        if let Some(status) = update.status {
            if !self.status.can_transition_to(status) {
                return Err(CoreError::Conflict(format!(
                    "Job {} cannot move from {} to {}",
                    self.id, self.status, status
                )));
            }
        }

        if let Some(attempt) = update.attempt {
            if next_status != JobStatus::Processing {
                return Err(CoreError::Conflict(format!(
                    "Job {} attempt can only change while processing",
                    self.id
                )));
            }
            if attempt < self.attempt || attempt > self.max_attempts {
                return Err(CoreError::Validation(format!(
                    "Job {} attempt {attempt} outside {}..={}",
                    self.id, self.attempt, self.max_attempts
                )));
            }
        }

        if next_status.is_terminal() && update.status.is_some() {
            let has_result = update.result.is_some();
            let has_error = update.error.is_some();
            if has_result == has_error {
                return Err(CoreError::Validation(format!(
                    "Job {} must finish with exactly one of result or error",
                    self.id
                )));
            }
        } else if update.result.is_some() || update.error.is_some() {
            return Err(CoreError::Validation(format!(
                "Job {} result and error are only set on the terminal transition",
                self.id
            )));
        }

        self.status = next_status;
        if let Some(attempt) = update.attempt {
            self.attempt = attempt;
        }
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NewJob / JobUpdate
// ---------------------------------------------------------------------------

/// A submission, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    /// Falls back to [`JobKind::default_max_attempts`].
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            priority: DEFAULT_PRIORITY,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A partial update to a job's mutable state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub attempt: Option<u32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl JobUpdate {
    pub fn processing(started_at: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    pub fn completed(result: serde_json::Value, completed_at: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result: Some(result),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, completed_at: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }

    pub fn attempt(attempt: u32) -> Self {
        Self {
            attempt: Some(attempt),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
