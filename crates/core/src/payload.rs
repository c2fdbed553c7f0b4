//! Kind-specific job payloads.
//!
//! The queue stores payloads as opaque JSON; each handler decodes and
//! validates its own shape with [`decode_payload`] before doing any work.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::parsing::ParserSpec;

/// Sampling parameters forwarded to the text backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct InferenceParams {
    #[validate(range(min = 1, max = 32768))]
    pub max_tokens: u32,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<i64>,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
            seed: None,
        }
    }
}

/// Payload of a `text_generation` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TextGenerationPayload {
    #[validate(length(min = 1))]
    pub prompt: String,
    #[serde(default)]
    #[validate(nested)]
    pub params: InferenceParams,
    /// When absent the raw text is the result and no retry logic applies.
    #[serde(default)]
    pub parser: Option<ParserSpec>,
}

/// Payload of an `image_generation` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ImageGenerationPayload {
    /// Name of the workflow template to render.
    #[validate(length(min = 1))]
    pub workflow: String,
    #[validate(length(min = 1))]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    #[validate(range(min = 64, max = 4096))]
    pub width: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 64, max = 4096))]
    pub height: Option<u32>,
    /// Random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    #[validate(range(min = 1, max = 200))]
    pub steps: Option<u32>,
    /// Sub-directory the artifact is filed under.
    #[serde(default = "default_category")]
    #[validate(length(min = 1, max = 64))]
    pub category: String,
    #[serde(default = "default_filename_prefix")]
    #[validate(length(min = 1, max = 64))]
    pub filename_prefix: String,
}

/// Payload of a generic `workflow` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct WorkflowPayload {
    #[validate(length(min = 1))]
    pub workflow: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_filename_prefix() -> String {
    "image".to_string()
}

/// Decode and validate a job payload.
pub fn decode_payload<T>(payload: &serde_json::Value) -> Result<T, CoreError>
where
    T: DeserializeOwned + Validate,
{
    let decoded: T = serde_json::from_value(payload.clone())
        .map_err(|e| CoreError::Validation(e.to_string()))?;
    decoded
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;
    Ok(decoded)
}
