//! Event types for stream observability
//!
//! Published on the [`EventBus`](super::EventBus) as the engine moves items
//! and workers through their lifecycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BatchId, Order, WorkerId};

/// All stream lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An input payload was registered
    ItemAdded {
        order: Order,
        timestamp: DateTime<Utc>,
    },

    /// The producer signalled end of input
    InputEnded {
        items: u64,
        timestamp: DateTime<Utc>,
    },

    /// A batch was handed to a worker
    BatchDispatched {
        batch: BatchId,
        worker: WorkerId,
        orders: Vec<Order>,
        timestamp: DateTime<Utc>,
    },

    /// A worker returned results for a batch
    ResultsReceived {
        batch: BatchId,
        worker: WorkerId,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// An item's vote settled
    ItemResolved {
        order: Order,
        votes: u32,
        margin: u32,
        timestamp: DateTime<Utc>,
    },

    /// An accepted value was pushed downstream
    ItemFlushed {
        order: Order,
        timestamp: DateTime<Utc>,
    },

    /// A worker connected
    WorkerConnected {
        worker: WorkerId,
        timestamp: DateTime<Utc>,
    },

    /// A worker disconnected and its outstanding votes were retracted
    WorkerDisconnected {
        worker: WorkerId,
        retracted: usize,
        timestamp: DateTime<Utc>,
    },

    /// The consumer is saturated; flushing and dispatch pause
    BackpressureApplied {
        written: u64,
        timestamp: DateTime<Utc>,
    },

    /// The consumer asked for more
    BackpressureReleased {
        written: u64,
        timestamp: DateTime<Utc>,
    },

    /// The terminal sentinel was emitted
    StreamFinished {
        written: u64,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamEvent::ItemAdded { timestamp, .. } => *timestamp,
            StreamEvent::InputEnded { timestamp, .. } => *timestamp,
            StreamEvent::BatchDispatched { timestamp, .. } => *timestamp,
            StreamEvent::ResultsReceived { timestamp, .. } => *timestamp,
            StreamEvent::ItemResolved { timestamp, .. } => *timestamp,
            StreamEvent::ItemFlushed { timestamp, .. } => *timestamp,
            StreamEvent::WorkerConnected { timestamp, .. } => *timestamp,
            StreamEvent::WorkerDisconnected { timestamp, .. } => *timestamp,
            StreamEvent::BackpressureApplied { timestamp, .. } => *timestamp,
            StreamEvent::BackpressureReleased { timestamp, .. } => *timestamp,
            StreamEvent::StreamFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::ItemAdded { .. } => "item_added",
            StreamEvent::InputEnded { .. } => "input_ended",
            StreamEvent::BatchDispatched { .. } => "batch_dispatched",
            StreamEvent::ResultsReceived { .. } => "results_received",
            StreamEvent::ItemResolved { .. } => "item_resolved",
            StreamEvent::ItemFlushed { .. } => "item_flushed",
            StreamEvent::WorkerConnected { .. } => "worker_connected",
            StreamEvent::WorkerDisconnected { .. } => "worker_disconnected",
            StreamEvent::BackpressureApplied { .. } => "backpressure_applied",
            StreamEvent::BackpressureReleased { .. } => "backpressure_released",
            StreamEvent::StreamFinished { .. } => "stream_finished",
        }
    }

    /// Get the worker if this event is worker-scoped
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            StreamEvent::BatchDispatched { worker, .. } => Some(*worker),
            StreamEvent::ResultsReceived { worker, .. } => Some(*worker),
            StreamEvent::WorkerConnected { worker, .. } => Some(*worker),
            StreamEvent::WorkerDisconnected { worker, .. } => Some(*worker),
            _ => None,
        }
    }

    /// Get the item order if this event concerns a single item
    pub fn order(&self) -> Option<Order> {
        match self {
            StreamEvent::ItemAdded { order, .. } => Some(*order),
            StreamEvent::ItemResolved { order, .. } => Some(*order),
            StreamEvent::ItemFlushed { order, .. } => Some(*order),
            _ => None,
        }
    }

    /// Whether this event touches item `order`, including batch dispatch.
    pub fn concerns(&self, order: Order) -> bool {
        match self {
            StreamEvent::BatchDispatched { orders, .. } => orders.contains(&order),
            _ => self.order() == Some(order),
        }
    }
}
