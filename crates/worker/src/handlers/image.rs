//! Image generation through a workflow template.
//!
//! There is no retry loop here: a job runs the workflow once, and the
//! backend's memory is freed before the handler returns whatever happened.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use genqueue_comfyui::WorkflowLibrary;
use genqueue_core::backend::{ArtifactRef, ImageBackend, PromptStatus};
use genqueue_core::error::JobError;
use genqueue_core::job::JobKind;
use genqueue_core::payload::{decode_payload, ImageGenerationPayload};
use genqueue_events::JobEvent;

use super::{invalid_payload, JobContext, JobHandler};
use crate::artifacts::ArtifactStore;
use crate::config::ImagePipelineConfig;

/// Random seeds stay below 2^53 so JSON consumers read them exactly.
const MAX_RANDOM_SEED: u64 = 1 << 53;

pub struct ImageGenerationHandler {
    backend: Arc<dyn ImageBackend>,
    workflows: Arc<WorkflowLibrary>,
    artifacts: ArtifactStore,
    config: ImagePipelineConfig,
}

impl ImageGenerationHandler {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        workflows: Arc<WorkflowLibrary>,
        config: ImagePipelineConfig,
    ) -> Self {
        Self {
            backend,
            workflows,
            artifacts: ArtifactStore::new(config.artifact_dir.clone()),
            config,
        }
    }

    /// Submit, wait for, and store one workflow run.
    async fn generate(
        &self,
        ctx: &JobContext,
        payload: &ImageGenerationPayload,
        graph: &Value,
        seed: u64,
    ) -> Result<Value, JobError> {
        let job_id = ctx.job_id();
        let prompt_id = self.backend.submit_workflow(graph).await?;
        tracing::info!(job_id, prompt_id = %prompt_id, workflow = %payload.workflow, seed, "Image workflow submitted");

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let watch = tokio::time::timeout_at(deadline, self.backend.watch_progress(&prompt_id));
        let forwarder = watch.await.ok().flatten().map(|mut rx| {
            let events = Arc::clone(ctx.events());
            tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    events.emit(&JobEvent::ImageProgress {
                        job_id,
                        value: progress.value,
                        max: progress.max,
                    });
                }
            })
        });

        let outcome = self.wait_for_artifacts(job_id, &prompt_id, deadline).await;
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        let artifacts = outcome?;

        let artifact = artifacts.first().ok_or_else(|| {
            JobError::GenerationFailure("Workflow finished without producing an artifact".into())
        })?;
        let bytes = self.backend.fetch_artifact(artifact).await?;
        let saved = self
            .artifacts
            .save(
                JobKind::ImageGeneration,
                &payload.category,
                &payload.filename_prefix,
                &artifact.extension(),
                &bytes,
            )
            .await
            .map_err(|e| JobError::GenerationFailure(e.to_string()))?;

        tracing::info!(job_id, prompt_id = %prompt_id, path = %saved.path.display(), "Image saved");
        Ok(json!({
            "path": saved.path.to_string_lossy(),
            "filename": saved.filename,
            "prompt_id": prompt_id,
            "seed": seed,
            "workflow": payload.workflow,
            "artifacts": artifacts,
        }))
    }

    /// Poll until the prompt finishes, fails, or the timeout passes.
    ///
    /// Transient poll errors are tolerated until the deadline.
    async fn wait_for_artifacts(
        &self,
        job_id: i64,
        prompt_id: &str,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<ArtifactRef>, JobError> {
        loop {
            match self.backend.poll_status(prompt_id).await {
                Ok(PromptStatus::Done(artifacts)) => return Ok(artifacts),
                Ok(PromptStatus::Failed(message)) => {
                    return Err(JobError::GenerationFailure(format!(
                        "Image workflow failed: {message}"
                    )));
                }
                Ok(PromptStatus::Pending | PromptStatus::Running) => {}
                Err(e) => {
                    tracing::debug!(job_id, prompt_id, error = %e, "Status poll failed, retrying");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(job_id, prompt_id, timeout_secs = self.config.timeout.as_secs(), "Image workflow timed out");
                if let Err(e) = self.backend.interrupt().await {
                    tracing::warn!(job_id, prompt_id, error = %e, "Failed to interrupt timed out workflow");
                }
                return Err(JobError::GenerationFailure(format!(
                    "Image generation timed out after {}s",
                    self.config.timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl JobHandler for ImageGenerationHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let payload: ImageGenerationPayload =
            decode_payload(&ctx.job().payload).map_err(invalid_payload)?;

        if !self.backend.is_reachable().await {
            return Err(JobError::ResourceUnavailable(
                "Image backend is not reachable".into(),
            ));
        }

        let outcome = async {
            let template = self
                .workflows
                .get(&payload.workflow)
                .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
            let seed = payload
                .seed
                .unwrap_or_else(|| rand::rng().random_range(0..MAX_RANDOM_SEED));
            let graph = template
                .render(&slot_values(&payload, seed))
                .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
            self.generate(ctx, &payload, &graph, seed).await
        }
        .await;

        if let Err(e) = self.backend.free_memory().await {
            tracing::warn!(job_id = ctx.job_id(), error = %e, "Failed to free image backend memory");
        }
        outcome
    }
}

/// Template slot values for a payload. Unset optional fields keep the
/// template's own defaults.
fn slot_values(payload: &ImageGenerationPayload, seed: u64) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    values.insert("prompt".to_string(), json!(payload.prompt));
    values.insert("seed".to_string(), json!(seed));
    values.insert("filename_prefix".to_string(), json!(payload.filename_prefix));
    if let Some(negative) = &payload.negative_prompt {
        values.insert("negative_prompt".to_string(), json!(negative));
    }
    if let Some(width) = payload.width {
        values.insert("width".to_string(), json!(width));
    }
    if let Some(height) = payload.height {
        values.insert("height".to_string(), json!(height));
    }
    if let Some(steps) = payload.steps {
        values.insert("steps".to_string(), json!(steps));
    }
    values
}
