use std::time::Duration;

use genqueue_core::env;
use genqueue_core::error::CoreError;

/// Connection settings for the ComfyUI image backend.
#[derive(Debug, Clone)]
pub struct ComfyUIConfig {
    /// HTTP base URL, without a trailing slash.
    pub api_url: String,
    /// WebSocket base URL, without a trailing slash.
    pub ws_url: String,
    /// Per-request timeout for REST calls.
    pub request_timeout: Duration,
}

impl ComfyUIConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                       |
    /// |--------------------------------|-------------------------------|
    /// | `COMFYUI_URL`                  | `http://127.0.0.1:8188`       |
    /// | `COMFYUI_WS_URL`               | derived from `COMFYUI_URL`    |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS` | `30`                          |
    pub fn from_env() -> Result<Self, CoreError> {
        let api_url = env::string_or("COMFYUI_URL", "http://127.0.0.1:8188");
        let ws_url = std::env::var("COMFYUI_WS_URL").ok();
        let timeout_secs: u64 = env::parse_or("COMFYUI_REQUEST_TIMEOUT_SECS", 30)?;

        Self::new(&api_url, ws_url.as_deref(), Duration::from_secs(timeout_secs))
    }

    pub fn new(
        api_url: &str,
        ws_url: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let api_url = api_url.trim_end_matches('/').to_string();
        let ws_url = match ws_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => derive_ws_url(&api_url)?,
        };
        Ok(Self {
            api_url,
            ws_url,
            request_timeout,
        })
    }
}

/// `http://host` becomes `ws://host`, `https://host` becomes `wss://host`.
fn derive_ws_url(api_url: &str) -> Result<String, CoreError> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(CoreError::Validation(format!(
            "COMFYUI_URL must start with http:// or https:// (got {api_url:?})"
        )))
    }
}
