//! [`ImageBackend`] implementation over the ComfyUI REST API.
//!
//! Status is derived in two steps: `/queue` says whether the prompt is
//! still pending or running, and once it has left the queue `/history`
//! holds its outputs or its execution error.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use genqueue_core::backend::{ArtifactRef, BackendError, ImageBackend, ImageProgress, PromptStatus};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::config::ComfyUIConfig;
use crate::progress;

pub struct ComfyUIBackend {
    api: ComfyUIApi,
    ws_url: String,
    /// Sent with every submission so WebSocket progress reaches us.
    client_id: String,
}

impl ComfyUIBackend {
    pub fn new(config: &ComfyUIConfig) -> Result<Self, BackendError> {
        let api = ComfyUIApi::new(config.api_url.clone(), config.request_timeout)
            .map_err(|e| e.into_backend(config.request_timeout))?;
        Ok(Self {
            api,
            ws_url: config.ws_url.clone(),
            client_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn map_err(&self, err: ComfyUIApiError) -> BackendError {
        err.into_backend(self.api.timeout())
    }
}

#[async_trait]
impl ImageBackend for ComfyUIBackend {
    async fn is_reachable(&self) -> bool {
        match self.api.system_stats().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = self.api.api_url(), error = %e, "ComfyUI not reachable");
                false
            }
        }
    }

    async fn submit_workflow(&self, graph: &Value) -> Result<String, BackendError> {
        let response = self
            .api
            .submit_workflow(graph, &self.client_id)
            .await
            .map_err(|e| self.map_err(e))?;

        if has_node_errors(&response.node_errors) {
            return Err(BackendError::Request(format!(
                "Workflow rejected: {}",
                response.node_errors
            )));
        }

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn poll_status(&self, prompt_id: &str) -> Result<PromptStatus, BackendError> {
        let queue = self.api.get_queue().await.map_err(|e| self.map_err(e))?;
        if let Some(status) = queue_status(&queue, prompt_id) {
            return Ok(status);
        }

        let history = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(history_status(&history, prompt_id))
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        self.api.view(artifact).await.map_err(|e| self.map_err(e))
    }

    async fn free_memory(&self) -> Result<(), BackendError> {
        self.api.free().await.map_err(|e| self.map_err(e))?;
        tracing::info!("ComfyUI models unloaded and memory freed");
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.api.interrupt().await.map_err(|e| self.map_err(e))
    }

    async fn watch_progress(&self, prompt_id: &str) -> Option<mpsc::Receiver<ImageProgress>> {
        match progress::watch(&self.ws_url, &self.client_id, prompt_id, self.api.timeout()).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Progress relay unavailable");
                None
            }
        }
    }
}

fn has_node_errors(node_errors: &Value) -> bool {
    match node_errors {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// `Running`/`Pending` when `prompt_id` is still in the `/queue` response.
///
/// Queue entries are arrays of `[number, prompt_id, graph, extra, outputs]`.
pub fn queue_status(queue: &Value, prompt_id: &str) -> Option<PromptStatus> {
    let contains = |key: &str| {
        queue[key]
            .as_array()
            .is_some_and(|entries| entries.iter().any(|e| e[1].as_str() == Some(prompt_id)))
    };

    if contains("queue_running") {
        Some(PromptStatus::Running)
    } else if contains("queue_pending") {
        Some(PromptStatus::Pending)
    } else {
        None
    }
}

/// Interpret a `/history/{prompt_id}` response.
///
/// A prompt missing from history has not been recorded yet and counts as
/// pending. Artifacts are listed in node order, `output` files first.
pub fn history_status(history: &Value, prompt_id: &str) -> PromptStatus {
    let Some(entry) = history.get(prompt_id) else {
        return PromptStatus::Pending;
    };

    let status = &entry["status"];
    if status["status_str"].as_str() == Some("error") {
        return PromptStatus::Failed(execution_error_message(status));
    }
    if status["completed"].as_bool() == Some(false) {
        return PromptStatus::Running;
    }

    let mut nodes: Vec<(&String, &Value)> = entry["outputs"]
        .as_object()
        .map(|outputs| outputs.iter().collect())
        .unwrap_or_default();
    nodes.sort_by(|a, b| compare_node_ids(a.0, b.0));

    let mut artifacts: Vec<ArtifactRef> = nodes
        .into_iter()
        .flat_map(|(_, output)| ["images", "gifs", "videos"].map(|key| output[key].clone()))
        .filter_map(|files| serde_json::from_value::<Vec<ArtifactRef>>(files).ok())
        .flatten()
        .collect();
    // Stable sort keeps node order within each bucket.
    artifacts.sort_by_key(|a| a.kind != "output");

    PromptStatus::Done(artifacts)
}

fn execution_error_message(status: &Value) -> String {
    status["messages"]
        .as_array()
        .and_then(|messages| {
            messages.iter().find_map(|m| {
                (m[0].as_str() == Some("execution_error"))
                    .then(|| m[1]["exception_message"].as_str())
                    .flatten()
            })
        })
        .map(|msg| msg.trim().to_string())
        .unwrap_or_else(|| "ComfyUI reported an execution error".to_string())
}

/// Numeric node ids sort numerically, anything else lexically after them.
fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
