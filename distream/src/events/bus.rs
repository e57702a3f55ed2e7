//! Event bus for stream observability
//!
//! Tokio broadcast pub/sub. Publishing never blocks the engine and succeeds
//! whether or not anyone is listening.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::StreamEvent;
use crate::types::{Order, WorkerId};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create an event bus whose subscribers may lag by up to `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Returns the number of receivers.
    pub fn publish(&self, event: StreamEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            // No receivers is OK
            Err(_) => 0,
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events matching a filter
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by worker
    pub worker: Option<WorkerId>,
    /// Follow a single item
    pub order: Option<Order>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by worker
    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Follow one item through dispatch, voting and flush
    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if let Some(worker) = self.worker {
            if event.worker() != Some(worker) {
                return false;
            }
        }

        if let Some(order) = self.order {
            if !event.concerns(order) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<StreamEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<StreamEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<StreamEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        let count = bus.publish(StreamEvent::ItemAdded {
            order: 0,
            timestamp: Utc::now(),
        });
        assert_eq!(count, 1);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "item_added");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.has_subscribers());
        assert_eq!(
            bus.publish(StreamEvent::InputEnded {
                items: 0,
                timestamp: Utc::now()
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new().shared();
        let target = WorkerId::from_u128(1);
        let mut receiver = bus.subscribe_filtered(EventFilter::new().worker(target));

        bus.publish(StreamEvent::WorkerConnected {
            worker: WorkerId::from_u128(2),
            timestamp: Utc::now(),
        });
        bus.publish(StreamEvent::ItemAdded {
            order: 0,
            timestamp: Utc::now(),
        });
        bus.publish(StreamEvent::WorkerConnected {
            worker: target,
            timestamp: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.worker(), Some(target));
    }

    #[test]
    fn test_filter_by_order_includes_batches() {
        let filter = EventFilter::new().order(3);
        assert!(filter.matches(&StreamEvent::BatchDispatched {
            batch: 0,
            worker: WorkerId::from_u128(1),
            orders: vec![2, 3, 4],
            timestamp: Utc::now()
        }));
        assert!(filter.matches(&StreamEvent::ItemResolved {
            order: 3,
            votes: 1,
            margin: 1,
            timestamp: Utc::now()
        }));
        assert!(!filter.matches(&StreamEvent::ItemFlushed {
            order: 4,
            timestamp: Utc::now()
        }));
        assert!(!filter.matches(&StreamEvent::StreamFinished {
            written: 5,
            timestamp: Utc::now()
        }));
    }

    #[test]
    fn test_filter_by_type() {
        let filter = EventFilter::new().types(vec!["item_flushed"]);
        assert!(filter.matches(&StreamEvent::ItemFlushed {
            order: 1,
            timestamp: Utc::now()
        }));
        assert!(!filter.matches(&StreamEvent::ItemAdded {
            order: 1,
            timestamp: Utc::now()
        }));
    }
}
