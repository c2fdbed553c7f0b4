//! Exclusive accelerator ownership between the text and image backends.
//!
//! Handoff is lazy: nothing is released when a job finishes. The next job
//! that needs the other backend unloads the current holder first, and a
//! failed unload is logged but never blocks the handoff.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use genqueue_core::backend::{BackendError, ImageBackend, TextBackend};
use genqueue_core::job::JobKind;
use genqueue_events::{EventBus, JobEvent};

/// Which backend currently owns accelerator memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    Text,
    Image,
}

impl Holder {
    pub fn as_str(self) -> &'static str {
        match self {
            Holder::Text => "text_backend",
            Holder::Image => "image_backend",
        }
    }

    /// The backend a kind runs on. Workflows only orchestrate child jobs.
    pub fn for_kind(kind: JobKind) -> Option<Holder> {
        match kind {
            JobKind::TextGeneration => Some(Holder::Text),
            JobKind::ImageGeneration => Some(Holder::Image),
            JobKind::Workflow => None,
        }
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend that can occupy the accelerator.
#[async_trait]
pub trait AcceleratorTenant: Send + Sync {
    fn holder(&self) -> Holder;

    /// Whether the backend currently holds accelerator memory.
    async fn is_resident(&self) -> bool;

    /// Release accelerator memory.
    async fn release(&self) -> Result<(), BackendError>;
}

pub struct TextTenant(pub Arc<dyn TextBackend>);

#[async_trait]
impl AcceleratorTenant for TextTenant {
    fn holder(&self) -> Holder {
        Holder::Text
    }

    async fn is_resident(&self) -> bool {
        self.0.is_loaded().await
    }

    async fn release(&self) -> Result<(), BackendError> {
        self.0.unload().await
    }
}

pub struct ImageTenant(pub Arc<dyn ImageBackend>);

#[async_trait]
impl AcceleratorTenant for ImageTenant {
    fn holder(&self) -> Holder {
        Holder::Image
    }

    // The image backend keeps no model resident between jobs we can query,
    // so reachability stands in for "may hold memory".
    async fn is_resident(&self) -> bool {
        self.0.is_reachable().await
    }

    async fn release(&self) -> Result<(), BackendError> {
        self.0.free_memory().await
    }
}

/// What happened when a lease was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The requested backend already held the accelerator.
    Kept,
    /// No holder was recorded; any other resident tenant was released.
    Granted,
    /// The accelerator moved from another backend.
    Switched { from: Holder, release_ok: bool },
}

/// Proof of accelerator ownership, held while a generation handler runs.
pub struct AcceleratorLease {
    _guard: OwnedMutexGuard<Option<Holder>>,
    holder: Holder,
    handoff: Handoff,
}

impl AcceleratorLease {
    pub fn holder(&self) -> Holder {
        self.holder
    }

    pub fn handoff(&self) -> Handoff {
        self.handoff
    }
}

pub struct ResourceArbiter {
    current: Arc<Mutex<Option<Holder>>>,
    tenants: HashMap<Holder, Arc<dyn AcceleratorTenant>>,
    events: Arc<EventBus>,
}

impl ResourceArbiter {
    pub fn new(
        text: Arc<dyn TextBackend>,
        image: Arc<dyn ImageBackend>,
        events: Arc<EventBus>,
    ) -> Self {
        let tenants: Vec<Arc<dyn AcceleratorTenant>> =
            vec![Arc::new(TextTenant(text)), Arc::new(ImageTenant(image))];
        Self::with_tenants(tenants, events)
    }

    pub fn with_tenants(
        tenants: impl IntoIterator<Item = Arc<dyn AcceleratorTenant>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            tenants: tenants.into_iter().map(|t| (t.holder(), t)).collect(),
            events,
        }
    }

    /// The recorded holder, or `None` while a lease is out or nothing has run.
    pub fn current_holder(&self) -> Option<Holder> {
        self.current.try_lock().ok().and_then(|guard| *guard)
    }

    /// Take the accelerator for a job of `kind`, handing off if needed.
    ///
    /// Returns `None` for kinds that do not run on the accelerator.
    pub async fn acquire_for(&self, kind: JobKind) -> Option<AcceleratorLease> {
        let wanted = Holder::for_kind(kind)?;
        let mut guard = Arc::clone(&self.current).lock_owned().await;

        let handoff = match *guard {
            Some(current) if current == wanted => Handoff::Kept,
            Some(current) => {
                let release_ok = self.release(current).await;
                self.events.emit(&JobEvent::ResourceHandoff {
                    from: current.to_string(),
                    to: wanted.to_string(),
                    release_ok,
                });
                tracing::info!(from = %current, to = %wanted, release_ok, "Accelerator handed off");
                Handoff::Switched {
                    from: current,
                    release_ok,
                }
            }
            None => {
                for (holder, tenant) in &self.tenants {
                    if *holder != wanted && tenant.is_resident().await {
                        self.release(*holder).await;
                    }
                }
                tracing::debug!(to = %wanted, "Accelerator granted");
                Handoff::Granted
            }
        };

        *guard = Some(wanted);
        Some(AcceleratorLease {
            _guard: guard,
            holder: wanted,
            handoff,
        })
    }

    /// Best-effort release; failures are logged and reported as `false`.
    async fn release(&self, holder: Holder) -> bool {
        let Some(tenant) = self.tenants.get(&holder) else {
            return true;
        };
        match tenant.release().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(holder = %holder, error = %e, "Failed to release accelerator, continuing handoff");
                false
            }
        }
    }
}
