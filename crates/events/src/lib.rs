//! In-process event system for job lifecycle and generation progress.
//!
//! - [`EventBus`]: synchronous publish/subscribe keyed by dot-namespaced
//!   event names, filtered through a [`SchemaRegistry`].
//! - [`JobEvent`]: the typed events the queue and pipelines emit.
//! - [`StreamFanOut`]: replicates externally visible events into one
//!   bounded queue per connected observer.
//! - [`sse`]: wire framing and idle keep-alives for remote observers.

pub mod bus;
pub mod event;
pub mod fanout;
pub mod schema;
pub mod sse;

pub use bus::{BusEvent, EventBus};
pub use event::JobEvent;
pub use fanout::{StreamConnection, StreamEvent, StreamFanOut};
pub use schema::{EventSchema, FieldSpec, FieldType, SchemaRegistry};
