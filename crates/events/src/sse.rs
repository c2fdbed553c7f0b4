//! Wire framing for remote observers.
//!
//! Frames follow the server-sent events layout:
//!
//! ```text
//! event: generation.update
//! data: {"job_id":1,"text":"Once"}
//!
//! ```
//!
//! An idle connection gets an `event: ping` frame carrying a float UNIX
//! timestamp after each keep-alive window instead of being closed.

use std::time::Duration;

use genqueue_core::types::Timestamp;
use serde_json::{json, Value};

use crate::fanout::{StreamConnection, StreamEvent};

/// Idle window before a keep-alive ping is sent.
pub const KEEPALIVE: Duration = Duration::from_secs(30);

/// Event name of keep-alive frames.
pub const PING_EVENT: &str = "ping";

pub fn format_frame(event_name: &str, data: &Value) -> String {
    format!("event: {event_name}\ndata: {data}\n\n")
}

/// `{"timestamp": <seconds since the epoch as a float>}`.
pub fn ping_data(now: Timestamp) -> Value {
    json!({ "timestamp": now.timestamp_micros() as f64 / 1_000_000.0 })
}

pub fn ping_frame(now: Timestamp) -> String {
    format_frame(PING_EVENT, &ping_data(now))
}

/// One frame to write to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(StreamEvent),
    Ping(Timestamp),
}

impl StreamFrame {
    pub fn event_name(&self) -> &str {
        match self {
            StreamFrame::Event(event) => &event.name,
            StreamFrame::Ping(_) => PING_EVENT,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StreamFrame::Event(event) => event.data.clone(),
            StreamFrame::Ping(at) => ping_data(*at),
        }
    }

    pub fn to_wire(&self) -> String {
        format_frame(self.event_name(), &self.data())
    }
}

/// Next frame for `connection`: a queued event as soon as one arrives, or
/// a ping once `keepalive` passes without one.
///
/// Returns `None` once the connection has been removed and its backlog is
/// drained.
pub async fn next_frame(
    connection: &mut StreamConnection,
    keepalive: Duration,
) -> Option<StreamFrame> {
    match connection.next(keepalive).await {
        Some(event) => Some(StreamFrame::Event(event)),
        None if connection.is_active() => Some(StreamFrame::Ping(chrono::Utc::now())),
        None => None,
    }
}
