//! ComfyUI image backend.
//!
//! REST wrappers, a WebSocket progress relay, parameterizable workflow
//! templates, and [`ComfyUIBackend`], the `ImageBackend` the image job
//! pipeline drives.

pub mod api;
pub mod backend;
pub mod config;
pub mod messages;
pub mod progress;
pub mod workflow;

pub use backend::ComfyUIBackend;
pub use config::ComfyUIConfig;
pub use workflow::{TemplateError, WorkflowLibrary, WorkflowTemplate};
