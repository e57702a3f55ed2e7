//! Work item voting state
//!
//! A [`WorkItem`] is one input payload plus the tally of results workers have
//! returned for it. The item decides on its own whether it still needs more
//! workers ([`WorkItem::should_be_sent`]) and whether its vote is settled
//! ([`WorkItem::done_with_processing`]).
//!
//! The acceptance rule is a margin rule: the leading result must be ahead of
//! the runner-up by `redundancy` votes with nothing left in flight.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{Order, WorkerId};

/// Equality used to bucket result values for voting.
pub type EqualityFn<R> = Arc<dyn Fn(&R, &R) -> bool + Send + Sync>;

/// Bucket results with `PartialEq`.
pub fn structural_equality<R: PartialEq + 'static>() -> EqualityFn<R> {
    Arc::new(|a: &R, b: &R| a == b)
}

/// Bucket results by their JSON rendering. Values that fail to serialize
/// never compare equal.
pub fn json_equality<R: Serialize + 'static>() -> EqualityFn<R> {
    Arc::new(
        |a: &R, b: &R| match (serde_json::to_value(a), serde_json::to_value(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
    )
}

/// One distinct result value and the number of votes for it.
#[derive(Debug, Clone)]
struct ResultBucket<R> {
    value: R,
    count: u32,
}

/// Redundancy bookkeeping for a single input element.
#[derive(Debug, Clone)]
pub struct WorkItem<P, R> {
    order: Order,
    payload: P,
    redundancy: u32,
    results: Vec<ResultBucket<R>>,
    /// Index into `results` of the current leader.
    majority: Option<usize>,
    majority_count: u32,
    runner_up_count: u32,
    voters: HashSet<WorkerId>,
    in_flight: u32,
}

impl<P, R> WorkItem<P, R> {
    pub fn new(order: Order, payload: P, redundancy: u32) -> Self {
        Self {
            order,
            payload,
            redundancy,
            results: Vec::new(),
            majority: None,
            majority_count: 0,
            runner_up_count: 0,
            voters: HashSet::new(),
            in_flight: 0,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn redundancy(&self) -> u32 {
        self.redundancy
    }

    pub fn majority_count(&self) -> u32 {
        self.majority_count
    }

    pub fn runner_up_count(&self) -> u32 {
        self.runner_up_count
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Number of distinct result values seen so far.
    pub fn distinct_results(&self) -> usize {
        self.results.len()
    }

    /// Total votes received.
    pub fn total_votes(&self) -> u32 {
        self.results.iter().map(|b| b.count).sum()
    }

    pub fn has_voter(&self, worker: &WorkerId) -> bool {
        self.voters.contains(worker)
    }

    fn lead(&self) -> u32 {
        self.majority_count - self.runner_up_count
    }

    /// Whether another worker could still change the outcome: even if every
    /// in-flight vote went against the leader, the lead would fall short.
    pub fn should_be_sent(&self) -> bool {
        self.redundancy > self.in_flight + self.lead()
    }

    pub fn can_vote(&self, worker: &WorkerId) -> bool {
        self.should_be_sent() && !self.voters.contains(worker)
    }

    /// Record that `worker` now holds a copy of this item.
    pub fn add_voter(&mut self, worker: WorkerId) {
        self.voters.insert(worker);
        self.in_flight += 1;
    }

    /// Free the in-flight slot of a worker that went away. The tally is not
    /// touched.
    pub fn remove_voter(&mut self, worker: &WorkerId) {
        if self.voters.remove(worker) {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
    }

    /// Count a returned result.
    pub fn add_result(&mut self, _worker: &WorkerId, value: R, equality: &EqualityFn<R>) {
        self.in_flight = self.in_flight.saturating_sub(1);

        let index = match self
            .results
            .iter()
            .position(|bucket| equality(&bucket.value, &value))
        {
            Some(index) => {
                self.results[index].count += 1;
                index
            }
            None => {
                self.results.push(ResultBucket { value, count: 1 });
                self.results.len() - 1
            }
        };

        // Strictly greater: on a tie the bucket that got there first keeps the lead.
        if self.results[index].count > self.majority_count {
            self.majority = Some(index);
            self.majority_count = self.results[index].count;
        }
        self.runner_up_count = self
            .results
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.majority)
            .map(|(_, bucket)| bucket.count)
            .max()
            .unwrap_or(0);
    }

    /// The sole acceptance condition.
    pub fn done_with_processing(&self) -> bool {
        self.in_flight == 0 && self.lead() >= self.redundancy
    }

    /// Current leading value, settled or not.
    pub fn majority_result(&self) -> Option<&R> {
        self.majority.map(|i| &self.results[i].value)
    }

    /// The accepted value, once the vote is settled.
    pub fn accepted(&self) -> Option<&R> {
        if self.done_with_processing() {
            self.majority_result()
        } else {
            None
        }
    }

    /// Consume the item, yielding the accepted value.
    pub fn into_accepted(mut self) -> Option<R> {
        if !self.done_with_processing() {
            return None;
        }
        let index = self.majority?;
        Some(self.results.swap_remove(index).value)
    }
}
