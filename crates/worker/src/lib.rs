//! Priority job queue with single-worker lanes.
//!
//! Jobs are persisted through a [`genqueue_core::store::JobStore`], routed
//! to a lane by kind, and executed by that kind's handler. The text and
//! image handlers share the accelerator through the [`ResourceArbiter`].

pub mod arbiter;
pub mod artifacts;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod queue;

pub use arbiter::{AcceleratorLease, Handoff, Holder, ResourceArbiter};
pub use artifacts::ArtifactStore;
pub use config::{ImagePipelineConfig, LaneConfig, QueueConfig};
pub use engine::{JobQueue, QueueDeps, QueueError};
pub use handlers::{
    Handlers, ImageGenerationHandler, JobContext, JobHandler, TextGenerationHandler,
    WorkflowHandler, WorkflowRegistry,
};
