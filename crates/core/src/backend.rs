//! Contracts for the two generation backends sharing the accelerator.
//!
//! The job pipelines depend only on these traits. Concrete HTTP clients
//! live in their own crates, and tests substitute in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::payload::InferenceParams;

/// Failures reported by a generation backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Model is not loaded")]
    NotLoaded,

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Another generation holds the backend's guard.
    #[error("Backend is busy with another generation")]
    Busy,

    #[error("Backend request failed: {0}")]
    Request(String),

    #[error("Unexpected backend response: {0}")]
    Protocol(String),
}

impl From<BackendError> for JobError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotLoaded | BackendError::Unreachable(_) => {
                JobError::ResourceUnavailable(err.to_string())
            }
            BackendError::Busy => JobError::Busy,
            BackendError::Timeout(_) | BackendError::Request(_) | BackendError::Protocol(_) => {
                JobError::GenerationFailure(err.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Output of one text generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct TextGeneration {
    pub text: String,
    pub token_count: u32,
    pub duration: Duration,
}

/// A text-generation backend holding a model on the accelerator.
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn is_loaded(&self) -> bool;

    async fn load(&self) -> Result<(), BackendError>;

    /// Unload the model and free accelerator memory.
    async fn unload(&self) -> Result<(), BackendError>;

    /// Generate a completion, invoking `on_token` for each streamed chunk
    /// before returning.
    ///
    /// `on_token` runs on the caller's task, so it should hand work off
    /// rather than block.
    async fn generate_streaming(
        &self,
        prompt: &str,
        params: &InferenceParams,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<TextGeneration, BackendError>;
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Location of a produced file on the image backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage bucket on the backend (`output`, `temp`, ...).
    #[serde(rename = "type", default = "default_artifact_type")]
    pub kind: String,
}

fn default_artifact_type() -> String {
    "output".to_string()
}

impl ArtifactRef {
    /// Lowercased file extension, defaulting to `png`.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string())
    }
}

/// Execution state of a submitted workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptStatus {
    Pending,
    Running,
    /// Finished; artifacts in production order.
    Done(Vec<ArtifactRef>),
    /// The backend reported an execution error.
    Failed(String),
}

/// Step-level progress relayed while a workflow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProgress {
    pub value: u32,
    pub max: u32,
}

/// An image-generation backend reached over the network.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn is_reachable(&self) -> bool;

    /// Queue a filled-in workflow graph; returns the correlation id.
    async fn submit_workflow(&self, graph: &serde_json::Value) -> Result<String, BackendError>;

    async fn poll_status(&self, prompt_id: &str) -> Result<PromptStatus, BackendError>;

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError>;

    /// Unload models and free accelerator memory.
    async fn free_memory(&self) -> Result<(), BackendError>;

    /// Interrupt whatever is currently executing.
    async fn interrupt(&self) -> Result<(), BackendError>;

    /// Optional live progress for a submitted prompt. Polling stays the
    /// source of truth; backends without a push channel return `None`.
    async fn watch_progress(
        &self,
        _prompt_id: &str,
    ) -> Option<tokio::sync::mpsc::Receiver<ImageProgress>> {
        None
    }
}
