use std::time::Duration;

use genqueue_core::env;
use genqueue_core::error::CoreError;
use genqueue_events::fanout::DEFAULT_CAPACITY;
use genqueue_events::sse::KEEPALIVE;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). The event stream
    /// and wait routes are not subject to it.
    pub request_timeout_secs: u64,
    /// Budget for draining the queue after the server stops (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Idle window before a stream connection receives a ping (default: `30`).
    pub stream_keepalive_secs: u64,
    /// Per-connection event backlog (default: `256`).
    pub stream_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".to_string()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            stream_keepalive_secs: KEEPALIVE.as_secs(),
            stream_queue_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                 |
    /// |-------------------------|-------------------------|
    /// | `HOST`                  | `0.0.0.0`               |
    /// | `PORT`                  | `3000`                  |
    /// | `CORS_ORIGINS`          | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                    |
    /// | `STREAM_KEEPALIVE_SECS` | `30`                    |
    /// | `STREAM_QUEUE_CAPACITY` | `256`                   |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();

        let config = Self {
            host: env::string_or("HOST", &defaults.host),
            port: env::parse_or("PORT", defaults.port)?,
            cors_origins: env::split_list(&env::string_or(
                "CORS_ORIGINS",
                &defaults.cors_origins.join(","),
            )),
            request_timeout_secs: env::parse_or(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            shutdown_timeout_secs: env::parse_or(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout_secs,
            )?,
            stream_keepalive_secs: env::parse_or(
                "STREAM_KEEPALIVE_SECS",
                defaults.stream_keepalive_secs,
            )?,
            stream_queue_capacity: env::parse_or(
                "STREAM_QUEUE_CAPACITY",
                defaults.stream_queue_capacity,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.stream_keepalive_secs == 0 {
            return Err(CoreError::Validation(
                "STREAM_KEEPALIVE_SECS must be at least 1".into(),
            ));
        }
        if self.stream_queue_capacity == 0 {
            return Err(CoreError::Validation(
                "STREAM_QUEUE_CAPACITY must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(CoreError::Validation(
                "REQUEST_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn stream_keepalive(&self) -> Duration {
        Duration::from_secs(self.stream_keepalive_secs)
    }
}
