//! Generic multi-step workflows.
//!
//! A workflow orchestrates child generation jobs on the same queue and
//! reports its progress as `workflow.step` events. Workflows run on their
//! own lane and never hold the accelerator themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use genqueue_core::error::JobError;
use genqueue_core::job::{JobKind, NewJob};
use genqueue_core::parsing::ParserSpec;
use genqueue_core::payload::{decode_payload, WorkflowPayload};
use genqueue_events::JobEvent;

use super::{invalid_payload, JobContext, JobHandler};

#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &JobContext, input: &Value) -> Result<Value, JobError>;
}

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in workflows.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IllustratedDescription));
        registry
    }

    /// Add or replace a workflow under its own name.
    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.name().to_string(), workflow);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct WorkflowHandler {
    registry: WorkflowRegistry,
}

impl WorkflowHandler {
    pub fn new(registry: WorkflowRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl JobHandler for WorkflowHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let payload: WorkflowPayload = decode_payload(&ctx.job().payload).map_err(invalid_payload)?;
        let workflow = self.registry.get(&payload.workflow).ok_or_else(|| {
            JobError::InvalidPayload(format!("Unknown workflow '{}'", payload.workflow))
        })?;

        tracing::info!(job_id = ctx.job_id(), workflow = workflow.name(), "Running workflow");
        workflow.run(ctx, &payload.input).await
    }
}

// ---------------------------------------------------------------------------
// Built-in: illustrated description
// ---------------------------------------------------------------------------

/// Writes a short description of a subject, then illustrates it.
///
/// Step one is a text job whose output must parse into a JSON object with
/// `description` and `image_prompt`; step two renders `image_prompt` with
/// an image workflow template.
pub struct IllustratedDescription;

pub const ILLUSTRATED_DESCRIPTION: &str = "illustrated_description";

#[derive(Debug, Deserialize, Validate)]
struct IllustratedInput {
    #[validate(length(min = 1, max = 500))]
    subject: String,
    #[serde(default)]
    style: Option<String>,
    #[serde(default = "default_image_workflow")]
    image_workflow: String,
    #[serde(default = "default_category")]
    category: String,
}

fn default_image_workflow() -> String {
    "txt2img".to_string()
}

fn default_category() -> String {
    "illustrations".to_string()
}

fn description_prompt(input: &IllustratedInput) -> String {
    let style = input
        .style
        .as_deref()
        .map(|s| format!(" in a {s} style"))
        .unwrap_or_default();
    format!(
        "Describe {subject}{style} in two or three vivid sentences. \
         Respond with only a JSON object with the keys \"description\" \
         (the prose) and \"image_prompt\" (a concise, comma-separated \
         prompt for an image generator).",
        subject = input.subject,
    )
}

#[async_trait]
impl Workflow for IllustratedDescription {
    fn name(&self) -> &str {
        ILLUSTRATED_DESCRIPTION
    }

    async fn run(&self, ctx: &JobContext, input: &Value) -> Result<Value, JobError> {
        let input: IllustratedInput = decode_payload(input).map_err(invalid_payload)?;
        let job_id = ctx.job_id();
        let priority = ctx.job().priority;

        ctx.emit(&JobEvent::WorkflowStep {
            job_id,
            step: "describe".into(),
            detail: json!({"subject": input.subject}),
        });
        let parser = ParserSpec::new("json_object")
            .with_required_fields(["description", "image_prompt"]);
        let text_job = ctx
            .submit_and_wait(
                NewJob::new(
                    JobKind::TextGeneration,
                    json!({"prompt": description_prompt(&input), "parser": parser}),
                )
                .with_priority(priority),
            )
            .await?;

        let text_result = text_job.result.unwrap_or(Value::Null);
        if text_result["parsing_success"] != Value::Bool(true) {
            return Err(JobError::ParseFailure {
                attempt: text_job.attempt,
                reason: "description was not valid structured output".into(),
            });
        }
        let parsed = &text_result["parsed"];
        let (Some(description), Some(image_prompt)) = (
            parsed["description"].as_str(),
            parsed["image_prompt"].as_str(),
        ) else {
            return Err(JobError::ParseFailure {
                attempt: text_job.attempt,
                reason: "description and image_prompt must be strings".into(),
            });
        };

        ctx.emit(&JobEvent::WorkflowStep {
            job_id,
            step: "illustrate".into(),
            detail: json!({"text_job_id": text_job.id}),
        });
        let image_job = ctx
            .submit_and_wait(
                NewJob::new(
                    JobKind::ImageGeneration,
                    json!({
                        "workflow": input.image_workflow,
                        "prompt": image_prompt,
                        "category": input.category,
                        "filename_prefix": "illustration",
                    }),
                )
                .with_priority(priority),
            )
            .await?;

        ctx.emit(&JobEvent::WorkflowStep {
            job_id,
            step: "complete".into(),
            detail: json!({"text_job_id": text_job.id, "image_job_id": image_job.id}),
        });

        Ok(json!({
            "description": description,
            "image_prompt": image_prompt,
            "image": image_job.result,
            "text_job_id": text_job.id,
            "image_job_id": image_job.id,
        }))
    }
}
