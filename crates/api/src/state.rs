use std::sync::Arc;

use genqueue_events::StreamFanOut;
use genqueue_worker::JobQueue;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: every field is an `Arc` or a handle over one.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (immutable after startup).
    pub config: Arc<ServerConfig>,
    /// The job queue. Submissions, lookups and waits go through it.
    pub queue: JobQueue,
    /// Per-observer replication of bus events for the event stream.
    pub fanout: Arc<StreamFanOut>,
}
