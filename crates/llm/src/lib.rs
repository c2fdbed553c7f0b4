//! Text-generation backend over an Ollama-compatible HTTP API.

pub mod config;
pub mod guard;
pub mod ollama;
pub mod stream;

pub use config::OllamaConfig;
pub use guard::GuardedTextBackend;
pub use ollama::OllamaBackend;
