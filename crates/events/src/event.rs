//! Typed events emitted by the job queue and generation pipelines.
//!
//! Producers build a [`JobEvent`] variant instead of a loose JSON map, and
//! [`builtin_schemas`] declares exactly the fields each variant serializes,
//! so the registry's filtering never drops anything a typed event carries.

use genqueue_core::job::JobKind;
use genqueue_core::types::JobId;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::schema::{EventSchema, FieldSpec, FieldType};

pub const QUEUED: &str = "queue.job_queued";
pub const TEXT_UPDATE: &str = "generation.update";
pub const TEXT_RETRY: &str = "generation.retry";
pub const IMAGE_PROGRESS: &str = "image.progress";
pub const WORKFLOW_STEP: &str = "workflow.step";
pub const RESOURCE_HANDOFF: &str = "resource.handoff";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        kind: JobKind,
        priority: i32,
    },
    Started {
        job_id: JobId,
        kind: JobKind,
        attempt: u32,
        max_attempts: u32,
    },
    /// A streamed chunk of generated text.
    TextChunk { job_id: JobId, text: String },
    /// Structured parsing failed and the text is being regenerated.
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
    ImageProgress { job_id: JobId, value: u32, max: u32 },
    WorkflowStep {
        job_id: JobId,
        step: String,
        detail: Value,
    },
    Completed {
        job_id: JobId,
        kind: JobKind,
        result: Value,
        duration_ms: u64,
    },
    Failed {
        job_id: JobId,
        kind: JobKind,
        error: String,
        duration_ms: u64,
    },
    /// The accelerator changed hands. `release_ok` is false when the
    /// previous holder failed to unload.
    ResourceHandoff {
        from: String,
        to: String,
        release_ok: bool,
    },
}

impl JobEvent {
    pub fn name(&self) -> String {
        match self {
            JobEvent::Queued { .. } => QUEUED.to_string(),
            JobEvent::Started { kind, .. } => started(*kind),
            JobEvent::TextChunk { .. } => TEXT_UPDATE.to_string(),
            JobEvent::RetryScheduled { .. } => TEXT_RETRY.to_string(),
            JobEvent::ImageProgress { .. } => IMAGE_PROGRESS.to_string(),
            JobEvent::WorkflowStep { .. } => WORKFLOW_STEP.to_string(),
            JobEvent::Completed { kind, .. } => completed(*kind),
            JobEvent::Failed { kind, .. } => failed(*kind),
            JobEvent::ResourceHandoff { .. } => RESOURCE_HANDOFF.to_string(),
        }
    }

    /// The event's fields as a JSON object.
    pub fn fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

pub fn started(kind: JobKind) -> String {
    format!("{}.started", kind.event_prefix())
}

pub fn completed(kind: JobKind) -> String {
    format!("{}.completed", kind.event_prefix())
}

pub fn failed(kind: JobKind) -> String {
    format!("{}.failed", kind.event_prefix())
}

/// Schemas for every [`JobEvent`] name.
pub fn builtin_schemas() -> Vec<EventSchema> {
    use FieldType::*;

    let job_id = || FieldSpec::required("job_id", Integer);
    let kind = || FieldSpec::required("kind", String);

    let mut schemas = vec![
        EventSchema::new(
            QUEUED,
            vec![job_id(), kind(), FieldSpec::required("priority", Integer)],
            true,
        ),
        EventSchema::new(
            TEXT_UPDATE,
            vec![job_id(), FieldSpec::required("text", String)],
            true,
        ),
        EventSchema::new(
            TEXT_RETRY,
            vec![
                job_id(),
                FieldSpec::required("attempt", Integer),
                FieldSpec::required("max_attempts", Integer),
                FieldSpec::required("reason", String),
            ],
            true,
        ),
        EventSchema::new(
            IMAGE_PROGRESS,
            vec![
                job_id(),
                FieldSpec::required("value", Integer),
                FieldSpec::required("max", Integer),
            ],
            true,
        ),
        EventSchema::new(
            WORKFLOW_STEP,
            vec![
                job_id(),
                FieldSpec::required("step", String),
                FieldSpec::optional("detail", Any),
            ],
            true,
        ),
        EventSchema::new(
            RESOURCE_HANDOFF,
            vec![
                FieldSpec::required("from", String),
                FieldSpec::required("to", String),
                FieldSpec::required("release_ok", Boolean),
            ],
            false,
        ),
    ];

    for k in JobKind::ALL {
        schemas.push(EventSchema::new(
            started(k),
            vec![
                job_id(),
                kind(),
                FieldSpec::required("attempt", Integer),
                FieldSpec::required("max_attempts", Integer),
            ],
            true,
        ));
        schemas.push(EventSchema::new(
            completed(k),
            vec![
                job_id(),
                kind(),
                FieldSpec::optional("result", Any),
                FieldSpec::required("duration_ms", Integer),
            ],
            true,
        ));
        schemas.push(EventSchema::new(
            failed(k),
            vec![
                job_id(),
                kind(),
                FieldSpec::required("error", String),
                FieldSpec::required("duration_ms", Integer),
            ],
            true,
        ));
    }

    schemas
}
