//! Distributed Stream Library
//!
//! Spreads an ordered stream of work items across a fluctuating pool of
//! untrusted workers and emits one accepted result per item, in input order.
//!
//! # Features
//!
//! ## Redundancy voting
//! Each item is sent to several workers. A result is accepted once its vote
//! lead over the runner-up reaches the configured redundancy and nothing is
//! still in flight.
//!
//! ## Load balancing
//! - `single`: one item per batch
//! - `chunk`: fixed batch size (default 100)
//! - `adaptive`: scales each worker's batch by its speed relative to the fleet
//!
//! ## Flow control
//! Output is flushed strictly in input order. A saturated consumer pauses
//! both flushing and dispatch until demand returns.
//!
//! # Usage
//!
//! ```ignore
//! use distream::{event_channel, ChannelTransport, DistributedStream, StreamConfig};
//!
//! let (events, events_rx) = event_channel::<u64>();
//! let transport = ChannelTransport::<u64, u64>::new(events);
//! let link = transport.connect(WorkerId::new())?;
//!
//! let handle = DistributedStream::new(StreamConfig::default().with_redundancy(2))
//!     .spawn(transport, events_rx)?;
//! handle.writer.write(7).await?;
//! handle.writer.end().await?;
//! let results = handle.reader.collect().await;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod balancer;
pub mod config;
pub mod events;
pub mod item;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod transport;
pub mod types;

pub use balancer::LoadBalancer;
pub use config::{
    ConfigError, ConfigResult, Distribution, StreamConfig, DEFAULT_CHUNK_SIZE,
    DEFAULT_HIGH_WATER_MARK,
};
pub use events::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, StreamEvent};
pub use item::{json_equality, structural_equality, EqualityFn, WorkItem};
pub use ledger::{ItemLedger, LedgerError, LedgerResult, LedgerSignal, Popped, Verdict};
pub use orchestrator::{Orchestrator, OutputSink, StreamStats};
pub use registry::{ClientRecord, ClientRegistry, LoadStats, RegistrySignal, RegistrySummary};
pub use runtime::{
    ChannelSink, DistributedStream, StreamError, StreamHandle, StreamReader, StreamResult,
    StreamWriter,
};
pub use transport::{
    event_channel, ChannelTransport, Transport, TransportError, TransportEvent,
    TransportEventReceiver, TransportEvents, TransportResult, WorkerLink,
};
pub use types::{Batch, BatchId, Order, WorkerId};
