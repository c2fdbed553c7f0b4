//! Newline-delimited JSON framing for streamed generations.
//!
//! HTTP chunks do not align with lines (or even with UTF-8 characters),
//! so bytes are buffered until a full line is available.

use serde::Deserialize;

/// One line of a streamed `/api/generate` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    /// Generated token count; present on the final line.
    #[serde(default)]
    pub eval_count: Option<u32>,
    /// Total call duration in nanoseconds; present on the final line.
    #[serde(default)]
    pub total_duration: Option<u64>,
    /// Set instead of `response` when the server fails mid-stream.
    #[serde(default)]
    pub error: Option<String>,
}

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and drain every complete, non-blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

pub fn parse_chunk(line: &str) -> Result<GenerateChunk, serde_json::Error> {
    serde_json::from_str(line)
}
