//! Per-observer replication of externally visible bus events.
//!
//! [`StreamFanOut::attach`] subscribes once to every visible schema. Each
//! delivered event is copied into the bounded queue of every active
//! [`StreamConnection`] with a non-blocking send; a connection whose queue
//! is full or whose receiver is gone is deactivated and removed instead of
//! stalling the publisher. Reconnecting observers start with an empty
//! backlog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use genqueue_core::types::Timestamp;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};

/// Default per-connection queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// An event queued for one observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub name: String,
    pub data: Value,
    pub timestamp: Timestamp,
}

impl From<&BusEvent> for StreamEvent {
    fn from(event: &BusEvent) -> Self {
        Self {
            name: event.name.clone(),
            data: Value::Object(event.data.clone()),
            timestamp: event.timestamp,
        }
    }
}

struct Slot {
    sender: mpsc::Sender<StreamEvent>,
    active: Arc<AtomicBool>,
}

/// Registry of live observer connections.
pub struct StreamFanOut {
    connections: Mutex<HashMap<Uuid, Slot>>,
    capacity: usize,
}

impl StreamFanOut {
    /// Create a fan-out and subscribe it to every visible event on `bus`.
    ///
    /// Schemas registered after this call are not forwarded.
    pub fn attach(bus: &EventBus, capacity: usize) -> Arc<Self> {
        let fanout = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        });

        let mut names = Vec::new();
        for schema in bus.visible_schemas() {
            let weak = Arc::downgrade(&fanout);
            bus.subscribe(&schema.event_name, move |event: &BusEvent| {
                if let Some(fanout) = weak.upgrade() {
                    fanout.route(event);
                }
                Ok(())
            });
            names.push(schema.event_name.clone());
        }
        tracing::info!(events = names.len(), capacity = fanout.capacity, "Stream fan-out attached");
        tracing::debug!(events = ?names, "Stream fan-out subscriptions");

        fanout
    }

    /// Register a new observer with an empty queue.
    pub fn new_connection(self: &Arc<Self>) -> StreamConnection {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));

        self.lock().insert(
            id,
            Slot {
                sender,
                active: Arc::clone(&active),
            },
        );
        tracing::info!(connection_id = %id, "Stream connection opened");

        StreamConnection {
            id,
            receiver,
            fanout: Arc::downgrade(self),
            active,
        }
    }

    /// Copy `event` into every connection's queue without blocking.
    pub fn route(&self, event: &BusEvent) {
        let stream_event = StreamEvent::from(event);
        let mut connections = self.lock();

        let mut dropped = Vec::new();
        for (id, slot) in connections.iter() {
            match slot.sender.try_send(stream_event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection_id = %id, event = %event.name, "Stream queue full, dropping connection");
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(connection_id = %id, "Stream receiver gone, removing connection");
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            if let Some(slot) = connections.remove(&id) {
                slot.active.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Deactivate and remove one connection. Returns whether it existed.
    pub fn close(&self, id: Uuid) -> bool {
        match self.lock().remove(&id) {
            Some(slot) => {
                slot.active.store(false, Ordering::SeqCst);
                tracing::info!(connection_id = %id, "Stream connection closed");
                true
            }
            None => false,
        }
    }

    /// Close every connection. Used at process shutdown.
    pub fn shutdown_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, slot) in &drained {
            slot.active.store(false, Ordering::SeqCst);
        }
        tracing::info!(closed = drained.len(), "All stream connections closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One observer's view of the fan-out.
///
/// Dropping the connection removes it from the fan-out.
pub struct StreamConnection {
    id: Uuid,
    receiver: mpsc::Receiver<StreamEvent>,
    fanout: Weak<StreamFanOut>,
    active: Arc<AtomicBool>,
}

impl StreamConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// False once the fan-out has dropped or closed this connection.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for the next queued event.
    ///
    /// Returns a queued event immediately if one is present, and `None`
    /// when the timeout elapses. After the connection is removed, queued
    /// events still drain and then `None` is returned without waiting;
    /// check [`is_active`](Self::is_active) to tell the two apart.
    pub async fn next(&mut self, timeout: Duration) -> Option<StreamEvent> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                self.active.store(false, Ordering::SeqCst);
                None
            }
            Err(_) => None,
        }
    }

    pub fn close(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.close(self.id);
        }
        self.receiver.close();
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.close(self.id);
        }
    }
}
