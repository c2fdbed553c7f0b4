//! In-process publish/subscribe hub.
//!
//! [`EventBus`] delivers events synchronously, on the publisher's task, to
//! callbacks subscribed to an exact event name. Every publish is checked
//! against the [`SchemaRegistry`]: unknown names are a logged no-op, and
//! undeclared fields are stripped before any subscriber sees the data.
//!
//! Subscribers are isolated from each other and from the publisher. A
//! callback that returns `Err` or panics is logged and skipped; the rest
//! still receive the event. Callbacks should hand work off (e.g. into a
//! bounded channel) rather than block, since the publisher waits for them.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use genqueue_core::types::Timestamp;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::event::{builtin_schemas, JobEvent};
use crate::schema::{EventSchema, FieldSpec, SchemaRegistry};

/// An event as seen by subscribers, after schema filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub name: String,
    pub data: Map<String, Value>,
    pub timestamp: Timestamp,
}

/// Subscriber callback. Returning `Err` marks this delivery as failed.
pub type EventCallback = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Synchronous, schema-checked event bus.
///
/// Designed to be shared via `Arc<EventBus>`.
pub struct EventBus {
    registry: SchemaRegistry,
    subscribers: RwLock<HashMap<String, Vec<EventCallback>>>,
}

impl EventBus {
    /// A bus with an empty registry.
    pub fn new() -> Self {
        Self {
            registry: SchemaRegistry::new(),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// A bus with every [`JobEvent`] schema registered.
    pub fn with_builtin_schemas() -> Self {
        let bus = Self::new();
        for schema in builtin_schemas() {
            bus.register_schema(schema);
        }
        bus
    }

    /// Declare an event name, its fields, and whether observers may see it.
    pub fn register(
        &self,
        event_name: impl Into<String>,
        fields: Vec<FieldSpec>,
        visible_externally: bool,
    ) -> bool {
        self.register_schema(EventSchema::new(event_name, fields, visible_externally))
    }

    pub fn register_schema(&self, schema: EventSchema) -> bool {
        self.registry.register(schema)
    }

    pub fn schema(&self, event_name: &str) -> Option<Arc<EventSchema>> {
        self.registry.get(event_name)
    }

    pub fn visible_schemas(&self) -> Vec<Arc<EventSchema>> {
        self.registry.visible()
    }

    /// Subscribe to one registered event name.
    ///
    /// Returns `false` (and subscribes nothing) if the name is unknown.
    pub fn subscribe<F>(&self, event_name: &str, callback: F) -> bool
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if !self.registry.contains(event_name) {
            tracing::warn!(event = event_name, "Subscribe to unregistered event ignored");
            return false;
        }
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_name.to_string())
            .or_default()
            .push(Arc::new(callback));
        true
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Publish `data` under `event_name`.
    ///
    /// Returns `false` if the name is not registered; never panics.
    pub fn publish(&self, event_name: &str, data: Map<String, Value>) -> bool {
        self.dispatch(event_name, data).is_some()
    }

    /// Publish a JSON value; anything but an object is rejected.
    pub fn publish_json(&self, event_name: &str, data: Value) -> bool {
        match data {
            Value::Object(map) => self.publish(event_name, map),
            other => {
                tracing::warn!(event = event_name, data = %other, "Event data must be a JSON object");
                false
            }
        }
    }

    /// Publish a typed event.
    pub fn emit(&self, event: &JobEvent) -> bool {
        self.publish(&event.name(), event.fields())
    }

    /// Publish and report how many subscribers accepted the event.
    ///
    /// `None` means the event name is unknown.
    pub fn dispatch(&self, event_name: &str, data: Map<String, Value>) -> Option<usize> {
        let Some(schema) = self.registry.get(event_name) else {
            tracing::warn!(event = event_name, "Publish of unregistered event ignored");
            return None;
        };

        let (data, report) = schema.filter(&data);
        if !report.missing.is_empty() {
            tracing::warn!(
                event = event_name,
                missing = ?report.missing,
                "Event published without declared fields",
            );
        }
        if !report.mistyped.is_empty() {
            tracing::warn!(
                event = event_name,
                mistyped = ?report.mistyped,
                "Event fields do not match declared types",
            );
        }
        if !report.dropped.is_empty() {
            tracing::trace!(event = event_name, dropped = ?report.dropped, "Dropped undeclared fields");
        }

        // Snapshot so callbacks may subscribe or publish without deadlocking.
        let callbacks: Vec<EventCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
            .unwrap_or_default();

        let event = BusEvent {
            name: event_name.to_string(),
            data,
            timestamp: chrono::Utc::now(),
        };

        let mut delivered = 0;
        for (index, callback) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::error!(event = event_name, subscriber = index, error = %e, "Event subscriber failed");
                }
                Err(panic) => {
                    tracing::error!(
                        event = event_name,
                        subscriber = index,
                        panic = panic_message(panic.as_ref()),
                        "Event subscriber panicked",
                    );
                }
            }
        }

        tracing::trace!(event = event_name, delivered, total = callbacks.len(), "Event published");
        Some(delivered)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_builtin_schemas()
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
