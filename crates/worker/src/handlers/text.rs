//! Text generation with parse-and-regenerate retries.
//!
//! Without a parser the first generation is the result. With one, output
//! that fails to parse is thrown away and regenerated from scratch until
//! the attempt budget runs out. An exhausted budget still completes the
//! job, with `parsing_success: false` and the last generated text.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use genqueue_core::backend::TextBackend;
use genqueue_core::error::JobError;
use genqueue_core::parsing::ParserRegistry;
use genqueue_core::payload::{decode_payload, TextGenerationPayload};
use genqueue_events::JobEvent;

use super::{invalid_payload, JobContext, JobHandler};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextResult {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    /// Absent when no parser was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsing_success: Option<bool>,
    pub attempts: u32,
    pub tokens: u32,
    pub duration_ms: u64,
}

pub struct TextGenerationHandler {
    backend: Arc<dyn TextBackend>,
    parsers: ParserRegistry,
}

impl TextGenerationHandler {
    pub fn new(backend: Arc<dyn TextBackend>, parsers: ParserRegistry) -> Self {
        Self { backend, parsers }
    }

    async fn ensure_loaded(&self) -> Result<(), JobError> {
        if self.backend.is_loaded().await {
            return Ok(());
        }
        self.backend
            .load()
            .await
            .map_err(|e| JobError::ResourceUnavailable(format!("Failed to load text model: {e}")))
    }
}

#[async_trait]
impl JobHandler for TextGenerationHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let job = ctx.job();
        let payload: TextGenerationPayload =
            decode_payload(&job.payload).map_err(invalid_payload)?;
        let parser = payload
            .parser
            .as_ref()
            .map(|spec| self.parsers.resolve(spec))
            .transpose()
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;

        self.ensure_loaded().await?;

        let job_id = job.id;
        let max_attempts = job.max_attempts;
        let mut attempt = job.attempt;

        loop {
            let mut relay = |chunk: &str| {
                ctx.emit(&JobEvent::TextChunk {
                    job_id,
                    text: chunk.to_string(),
                });
            };
            let generation = self
                .backend
                .generate_streaming(&payload.prompt, &payload.params, &mut relay)
                .await?;

            tracing::debug!(
                job_id,
                attempt,
                tokens = generation.token_count,
                duration_ms = generation.duration.as_millis() as u64,
                "Text generated",
            );

            let mut result = TextResult {
                text: generation.text,
                parsed: None,
                parsing_success: None,
                attempts: attempt,
                tokens: generation.token_count,
                duration_ms: generation.duration.as_millis() as u64,
            };

            let Some(parser) = &parser else {
                return to_value(result);
            };

            match parser.parse(&result.text) {
                Ok(parsed) => {
                    result.parsed = Some(parsed);
                    result.parsing_success = Some(true);
                    return to_value(result);
                }
                Err(e) if attempt < max_attempts => {
                    let reason = JobError::ParseFailure {
                        attempt,
                        reason: e.to_string(),
                    };
                    tracing::warn!(job_id, attempt, max_attempts, error = %reason, "Parse failed, regenerating");
                    attempt += 1;
                    ctx.set_attempt(attempt).await?;
                    ctx.emit(&JobEvent::RetryScheduled {
                        job_id,
                        attempt,
                        max_attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        job_id,
                        attempt,
                        parser = parser.name(),
                        error = %e,
                        "Parse attempts exhausted, keeping last text",
                    );
                    result.parsing_success = Some(false);
                    return to_value(result);
                }
            }
        }
    }
}

fn to_value(result: TextResult) -> Result<Value, JobError> {
    serde_json::to_value(result)
        .map_err(|e| JobError::GenerationFailure(format!("Failed to encode result: {e}")))
}
