//! Identifiers and batch types shared across the engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Insertion sequence number of a work item. Defines output order.
pub type Order = u64;

/// Sequence number of a dispatched batch.
pub type BatchId = u64;

/// Identity of a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic identity, mostly for tests and simulations.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A group of payloads handed to one worker in a single round trip.
///
/// `orders[i]` is the work item that `payloads[i]` belongs to; results are
/// expected back in the same positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch<P> {
    pub id: BatchId,
    pub worker: WorkerId,
    pub orders: Vec<Order>,
    pub payloads: Vec<P>,
}

impl<P> Batch<P> {
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}
