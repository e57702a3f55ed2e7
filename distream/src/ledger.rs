//! Item ledger - owner of every work item and its state transitions
//!
//! Items move through three stages:
//!
//! ```text
//!   add_item ──▶ waiting ──(vote settles)──▶ resolved ──(pop_resolved)──▶ gone
//!                  ▲   │
//!                  └───┘ get_sendable / handle_result / remove_vote
//! ```
//!
//! The ledger never blocks. When a worker asks for items and none are
//! votable, [`ItemLedger::get_sendable`] returns `None` and the caller parks
//! the request until the ledger raises [`LedgerSignal::NewItem`] or
//! [`LedgerSignal::Freed`], then asks again.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::item::{EqualityFn, WorkItem};
use crate::types::{Order, WorkerId};

/// Error type for ledger operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Unknown work item: {0}")]
    UnknownItem(Order),

    #[error("Worker {worker} does not hold item {order}")]
    NotHeld { worker: WorkerId, order: Order },
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Notifications raised by the ledger, drained with [`ItemLedger::take_signals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerSignal {
    /// A new item entered `waiting`.
    NewItem(Order),
    /// An item may have become votable again.
    Freed(Order),
    /// An item's vote settled and it moved to `resolved`.
    Resolved(Order),
}

/// Outcome of [`ItemLedger::pop_resolved`].
#[derive(Debug)]
pub enum Popped<P, R> {
    /// The item at the requested order, settled and removed from the ledger.
    Item(WorkItem<P, R>),
    /// Input ended and every item has been handed out. Returned once.
    Finished,
    /// Nothing to hand out for this order yet.
    Pending,
}

/// Result of counting one returned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The vote settled.
    Resolved,
    /// More votes are needed and the item is votable again.
    NeedsVotes,
    /// Still waiting on in-flight workers.
    Pending,
}

/// Single source of truth for item state and flush ordering.
pub struct ItemLedger<P, R> {
    redundancy: u32,
    equality: EqualityFn<R>,
    items: BTreeMap<Order, WorkItem<P, R>>,
    waiting: BTreeSet<Order>,
    resolved: BTreeSet<Order>,
    /// Items each worker currently holds without having answered.
    holdings: HashMap<WorkerId, BTreeSet<Order>>,
    read_count: u64,
    processed_count: u64,
    input_ended: bool,
    finished_emitted: bool,
    signals: Vec<LedgerSignal>,
}

impl<P: Clone, R> ItemLedger<P, R> {
    pub fn new(redundancy: u32, equality: EqualityFn<R>) -> Self {
        Self {
            redundancy,
            equality,
            items: BTreeMap::new(),
            waiting: BTreeSet::new(),
            resolved: BTreeSet::new(),
            holdings: HashMap::new(),
            read_count: 0,
            processed_count: 0,
            input_ended: false,
            finished_emitted: false,
            signals: Vec::new(),
        }
    }

    /// Register a payload under the next sequence number.
    pub fn add_item(&mut self, payload: P) -> Order {
        let order = self.read_count;
        self.read_count += 1;

        self.items
            .insert(order, WorkItem::new(order, payload, self.redundancy));
        self.waiting.insert(order);
        self.signals.push(LedgerSignal::NewItem(order));

        debug!(order, "Item added");
        order
    }

    /// No more items will be added.
    pub fn end_of_input(&mut self) {
        self.input_ended = true;
    }

    pub fn input_ended(&self) -> bool {
        self.input_ended
    }

    /// Input ended and every read item has settled.
    pub fn is_processing_finished(&self) -> bool {
        self.input_ended && self.processed_count == self.read_count
    }

    /// Claim up to `max_count` waiting items `worker` may vote on, lowest
    /// order first, and record the worker as holding them.
    ///
    /// Returns `None` when nothing is votable for this worker right now.
    pub fn get_sendable(&mut self, worker: WorkerId, max_count: usize) -> Option<Vec<(Order, P)>> {
        let max_count = max_count.max(1);
        let mut selected = Vec::new();

        for order in &self.waiting {
            if selected.len() == max_count {
                break;
            }
            let Some(item) = self.items.get_mut(order) else {
                continue;
            };
            if item.can_vote(&worker) {
                item.add_voter(worker);
                selected.push((*order, item.payload().clone()));
            }
        }

        if selected.is_empty() {
            return None;
        }

        self.holdings
            .entry(worker)
            .or_default()
            .extend(selected.iter().map(|(order, _)| *order));

        debug!(%worker, count = selected.len(), "Items claimed");
        Some(selected)
    }

    /// Count `value` as `worker`'s vote on item `order`.
    ///
    /// Results from a worker that does not hold the item (it was retracted
    /// on disconnect, or never sent) are rejected without touching the tally.
    pub fn handle_result(&mut self, order: Order, worker: WorkerId, value: R) -> LedgerResult<Verdict> {
        if !self.release_holding(&worker, order) {
            return Err(LedgerError::NotHeld { worker, order });
        }

        let item = self
            .items
            .get_mut(&order)
            .ok_or(LedgerError::UnknownItem(order))?;
        item.add_result(&worker, value, &self.equality);

        if item.done_with_processing() {
            self.waiting.remove(&order);
            self.resolved.insert(order);
            self.processed_count += 1;
            self.signals.push(LedgerSignal::Resolved(order));
            debug!(order, "Item resolved");
            Ok(Verdict::Resolved)
        } else if item.should_be_sent() {
            self.signals.push(LedgerSignal::Freed(order));
            debug!(
                order,
                majority = item.majority_count(),
                runner_up = item.runner_up_count(),
                "Item needs more votes"
            );
            Ok(Verdict::NeedsVotes)
        } else {
            Ok(Verdict::Pending)
        }
    }

    /// Retract every vote `worker` still has outstanding. Returns how many
    /// items were released.
    pub fn remove_vote(&mut self, worker: &WorkerId) -> usize {
        let Some(orders) = self.holdings.remove(worker) else {
            return 0;
        };

        for order in &orders {
            if let Some(item) = self.items.get_mut(order) {
                item.remove_voter(worker);
                self.signals.push(LedgerSignal::Freed(*order));
            }
        }

        if !orders.is_empty() {
            debug!(%worker, count = orders.len(), "Votes retracted");
        }
        orders.len()
    }

    /// Retract a single outstanding vote, e.g. a position missing from a
    /// short result batch.
    pub fn retract(&mut self, worker: &WorkerId, order: Order) -> bool {
        if !self.release_holding(worker, order) {
            return false;
        }
        match self.items.get_mut(&order) {
            Some(item) => {
                item.remove_voter(worker);
                self.signals.push(LedgerSignal::Freed(order));
                true
            }
            None => {
                warn!(%worker, order, "Retracted vote for missing item");
                false
            }
        }
    }

    fn release_holding(&mut self, worker: &WorkerId, order: Order) -> bool {
        let Some(held) = self.holdings.get_mut(worker) else {
            return false;
        };
        let removed = held.remove(&order);
        if held.is_empty() {
            self.holdings.remove(worker);
        }
        removed
    }

    /// Hand out the settled item at `order`.
    pub fn pop_resolved(&mut self, order: Order) -> Popped<P, R> {
        if self.is_processing_finished() && self.items.is_empty() {
            if self.finished_emitted {
                return Popped::Pending;
            }
            self.finished_emitted = true;
            return Popped::Finished;
        }

        if !self.resolved.remove(&order) {
            return Popped::Pending;
        }

        match self.items.remove(&order) {
            Some(item) => Popped::Item(item),
            None => Popped::Pending,
        }
    }

    /// Drain pending notifications.
    pub fn take_signals(&mut self) -> Vec<LedgerSignal> {
        std::mem::take(&mut self.signals)
    }

    pub fn get(&self, order: Order) -> Option<&WorkItem<P, R>> {
        self.items.get(&order)
    }

    /// Orders `worker` currently holds.
    pub fn held_by(&self, worker: &WorkerId) -> Vec<Order> {
        self.holdings
            .get(worker)
            .map(|held| held.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    /// Outstanding votes across all waiting items.
    pub fn in_flight_count(&self) -> u64 {
        self.waiting
            .iter()
            .filter_map(|order| self.items.get(order))
            .map(|item| u64::from(item.in_flight()))
            .sum()
    }

    /// Whether any waiting item is votable by someone other than the
    /// workers that already hold or voted on it.
    pub fn has_sendable(&self) -> bool {
        self.waiting
            .iter()
            .filter_map(|order| self.items.get(order))
            .any(|item| item.should_be_sent())
    }
}
