use std::time::Duration;

use genqueue_core::env;
use genqueue_core::error::CoreError;

/// Settings for the Ollama-compatible text backend.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// HTTP base URL, without a trailing slash.
    pub base_url: String,
    /// Model tag to load and generate with.
    pub model: String,
    /// How long the server keeps the model resident after a call
    /// (Ollama duration syntax, e.g. `30m`).
    pub keep_alive: String,
    /// Upper bound on one whole call, streaming included.
    pub request_timeout: Duration,
}

impl OllamaConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                   |
    /// |-------------------------------|---------------------------|
    /// | `OLLAMA_URL`                  | `http://127.0.0.1:11434`  |
    /// | `OLLAMA_MODEL`                | `llama3.1:8b`             |
    /// | `OLLAMA_KEEP_ALIVE`           | `30m`                     |
    /// | `OLLAMA_REQUEST_TIMEOUT_SECS` | `600`                     |
    pub fn from_env() -> Result<Self, CoreError> {
        let base_url = env::string_or("OLLAMA_URL", "http://127.0.0.1:11434")
            .trim_end_matches('/')
            .to_string();
        let model = env::string_or("OLLAMA_MODEL", "llama3.1:8b");
        if model.trim().is_empty() {
            return Err(CoreError::Validation("OLLAMA_MODEL must not be empty".into()));
        }
        let keep_alive = env::string_or("OLLAMA_KEEP_ALIVE", "30m");
        let timeout_secs: u64 = env::parse_or("OLLAMA_REQUEST_TIMEOUT_SECS", 600)?;

        Ok(Self {
            base_url,
            model,
            keep_alive,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}
