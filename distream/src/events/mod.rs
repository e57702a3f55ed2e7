//! Stream lifecycle events
//!
//! 1. **Event Types** (`types.rs`): what happened to items, batches,
//!    workers and the output.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast-based pub/sub with
//!    optional filtering.
//!
//! ```ignore
//! use distream::events::{EventBus, EventFilter};
//!
//! let bus = EventBus::new().shared();
//! let mut flushed = bus.subscribe_filtered(EventFilter::new().types(vec!["item_flushed"]));
//!
//! let orchestrator = orchestrator.with_event_bus(bus.clone());
//! let event = flushed.recv().await?;
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::StreamEvent;
