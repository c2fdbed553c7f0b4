//! [`TextBackend`] over the Ollama HTTP API.
//!
//! Residency is controlled through `keep_alive`: an empty-prompt generate
//! loads the model and `keep_alive: 0` unloads it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use genqueue_core::backend::{BackendError, TextBackend, TextGeneration};
use genqueue_core::payload::InferenceParams;

use crate::config::OllamaConfig;
use crate::stream::{parse_chunk, GenerateChunk, LineBuffer};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OllamaBackend {
    client: reqwest::Client,
    config: OllamaConfig,
}

#[derive(Debug, Deserialize)]
struct RunningModels {
    #[serde(default)]
    models: Vec<RunningModel>,
}

#[derive(Debug, Deserialize)]
struct RunningModel {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn map_err(&self, err: reqwest::Error) -> BackendError {
        if err.is_connect() {
            BackendError::Unreachable(err.to_string())
        } else if err.is_timeout() {
            BackendError::Timeout(self.config.request_timeout)
        } else if err.is_decode() {
            BackendError::Protocol(err.to_string())
        } else {
            BackendError::Request(err.to_string())
        }
    }

    /// Bound a whole call by the configured request timeout.
    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| BackendError::Timeout(self.config.request_timeout))?
    }

    async fn post_generate(&self, body: serde_json::Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Request(format!("Ollama API error ({status}): {text}")));
        }
        Ok(response)
    }

    async fn set_keep_alive(&self, keep_alive: serde_json::Value) -> Result<(), BackendError> {
        let body = json!({
            "model": self.config.model,
            "keep_alive": keep_alive,
        });
        self.bounded(async {
            let response = self.post_generate(body).await?;
            // Drain so the connection returns to the pool.
            response.bytes().await.map_err(|e| self.map_err(e))?;
            Ok(())
        })
        .await
    }

    async fn stream_generation(
        &self,
        prompt: &str,
        params: &InferenceParams,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<TextGeneration, BackendError> {
        let started = Instant::now();
        let body = generate_body(&self.config, prompt, params);
        let response = self.post_generate(body).await?;

        let mut bytes = response.bytes_stream();
        let mut buffer = LineBuffer::new();
        let mut text = String::new();
        let mut last = GenerateChunk::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| self.map_err(e))?;
            for line in buffer.push(&chunk) {
                last = accept_line(&line, &mut text, on_token)?;
            }
        }
        if let Some(line) = buffer.finish() {
            last = accept_line(&line, &mut text, on_token)?;
        }

        if !last.done {
            return Err(BackendError::Protocol(
                "Generation stream ended before completion".into(),
            ));
        }

        let duration = last
            .total_duration
            .map(Duration::from_nanos)
            .unwrap_or_else(|| started.elapsed());
        Ok(TextGeneration {
            token_count: last.eval_count.unwrap_or(0),
            text,
            duration,
        })
    }
}

/// Request body for a streamed generation.
fn generate_body(config: &OllamaConfig, prompt: &str, params: &InferenceParams) -> serde_json::Value {
    let mut options = json!({
        "num_predict": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
    });
    if !params.stop.is_empty() {
        options["stop"] = json!(params.stop);
    }
    if let Some(seed) = params.seed {
        options["seed"] = json!(seed);
    }

    json!({
        "model": config.model,
        "prompt": prompt,
        "stream": true,
        "keep_alive": config.keep_alive,
        "options": options,
    })
}

/// Parse one streamed line, relaying any text to `on_token`.
fn accept_line(
    line: &str,
    text: &mut String,
    on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
) -> Result<GenerateChunk, BackendError> {
    let chunk = parse_chunk(line)
        .map_err(|e| BackendError::Protocol(format!("Malformed stream line: {e}")))?;
    if let Some(error) = &chunk.error {
        return Err(BackendError::Request(error.clone()));
    }
    if !chunk.response.is_empty() {
        text.push_str(&chunk.response);
        on_token(&chunk.response);
    }
    Ok(chunk)
}

/// `llama3` and `llama3:latest` name the same model.
fn model_matches(configured: &str, reported: &str) -> bool {
    fn normalize(name: &str) -> &str {
        name.strip_suffix(":latest").unwrap_or(name)
    }
    !reported.is_empty() && normalize(configured) == normalize(reported)
}

#[async_trait]
impl TextBackend for OllamaBackend {
    async fn is_loaded(&self) -> bool {
        let result = self
            .bounded(async {
                let response = self
                    .client
                    .get(format!("{}/api/ps", self.config.base_url))
                    .send()
                    .await
                    .map_err(|e| self.map_err(e))?;
                response
                    .json::<RunningModels>()
                    .await
                    .map_err(|e| self.map_err(e))
            })
            .await;

        match result {
            Ok(running) => running.models.iter().any(|m| {
                model_matches(&self.config.model, &m.name)
                    || model_matches(&self.config.model, &m.model)
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Could not query loaded models");
                false
            }
        }
    }

    async fn load(&self) -> Result<(), BackendError> {
        tracing::info!(model = %self.config.model, "Loading text model");
        self.set_keep_alive(json!(self.config.keep_alive)).await
    }

    async fn unload(&self) -> Result<(), BackendError> {
        tracing::info!(model = %self.config.model, "Unloading text model");
        self.set_keep_alive(json!(0)).await
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        params: &InferenceParams,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<TextGeneration, BackendError> {
        self.bounded(self.stream_generation(prompt, params, on_token))
            .await
    }
}
