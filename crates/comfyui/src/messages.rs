//! ComfyUI WebSocket message types.
//!
//! Frames arrive as `{"type": "<kind>", "data": {...}}`. Only the kinds
//! the progress relay acts on are modelled; everything else parses to
//! [`ComfyUIMessage::Other`] so new server message types never break the
//! reader.

use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum ComfyUIMessage {
    /// A prompt began executing.
    ExecutionStart { prompt_id: String },

    /// A node started executing. `node == None` means the prompt finished.
    Executing {
        node: Option<String>,
        prompt_id: Option<String>,
    },

    /// Step progress of a long-running node such as a sampler.
    Progress(ProgressData),

    /// The prompt finished without error (newer servers only).
    ExecutionSuccess { prompt_id: String },

    ExecutionError(ErrorData),

    ExecutionInterrupted { prompt_id: String },

    /// Any other message kind (`status`, `executed`, `execution_cached`, ...).
    Other(String),
}

impl ComfyUIMessage {
    /// Prompt the message refers to, when it carries one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::ExecutionStart { prompt_id }
            | ComfyUIMessage::ExecutionSuccess { prompt_id }
            | ComfyUIMessage::ExecutionInterrupted { prompt_id } => Some(prompt_id),
            ComfyUIMessage::Executing { prompt_id, .. } => prompt_id.as_deref(),
            ComfyUIMessage::Progress(data) => data.prompt_id.as_deref(),
            ComfyUIMessage::ExecutionError(data) => Some(&data.prompt_id),
            ComfyUIMessage::Other(_) => None,
        }
    }

    /// Whether this message ends execution of `prompt_id`.
    pub fn finishes(&self, prompt_id: &str) -> bool {
        let terminal = matches!(
            self,
            ComfyUIMessage::Executing { node: None, .. }
                | ComfyUIMessage::ExecutionSuccess { .. }
                | ComfyUIMessage::ExecutionError(_)
                | ComfyUIMessage::ExecutionInterrupted { .. }
        );
        terminal && self.prompt_id() == Some(prompt_id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    /// Older servers omit the prompt id on progress frames.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct PromptRef {
    prompt_id: String,
}

#[derive(Deserialize)]
struct ExecutingRef {
    node: Option<String>,
    #[serde(default)]
    prompt_id: Option<String>,
}

/// Parse one text frame.
///
/// Fails only for malformed JSON or a known kind with a malformed body.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let message = match envelope.kind.as_str() {
        "execution_start" => ComfyUIMessage::ExecutionStart {
            prompt_id: data::<PromptRef>(envelope.data)?.prompt_id,
        },
        "executing" => {
            let executing: ExecutingRef = data(envelope.data)?;
            ComfyUIMessage::Executing {
                node: executing.node,
                prompt_id: executing.prompt_id,
            }
        }
        "progress" => ComfyUIMessage::Progress(data(envelope.data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess {
            prompt_id: data::<PromptRef>(envelope.data)?.prompt_id,
        },
        "execution_error" => ComfyUIMessage::ExecutionError(data(envelope.data)?),
        "execution_interrupted" => ComfyUIMessage::ExecutionInterrupted {
            prompt_id: data::<PromptRef>(envelope.data)?.prompt_id,
        },
        _ => ComfyUIMessage::Other(envelope.kind),
    };
    Ok(message)
}

fn data<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}
