//! Orchestrator - wires ledger, registry and balancer to a transport and an
//! output sink
//!
//! The orchestrator is a synchronous state machine. Every entry point
//! (`write`, `end`, `demand`, transport events) mutates state and then
//! pumps an internal signal queue until it is empty, so notifications
//! raised while handling one signal are processed in order without
//! recursion.
//!
//! Two kinds of waiting exist, both recorded as parked workers rather than
//! blocked calls:
//!
//! - a worker that found nothing votable waits for a new or freed item;
//! - a worker that became available while the consumer was saturated waits
//!   for demand.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::{ConfigResult, StreamConfig};
use crate::events::{SharedEventBus, StreamEvent};
use crate::item::EqualityFn;
use crate::ledger::{ItemLedger, LedgerSignal, Popped, Verdict};
use crate::registry::{ClientRegistry, RegistrySignal, RegistrySummary};
use crate::transport::{Transport, TransportEvent};
use crate::types::{Batch, BatchId, Order, WorkerId};

/// Downstream boundary.
pub trait OutputSink<R> {
    /// Emit an accepted value. Returns `false` when the consumer is
    /// saturated; the value is still taken.
    fn push(&mut self, value: R) -> bool;

    /// Emit the terminal sentinel.
    fn finish(&mut self);
}

/// Internal notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Available(WorkerId),
    Disconnected(WorkerId),
    /// An item was added or freed; parked workers should look again.
    Refresh,
    /// Something resolved; try to flush.
    Resolved,
    /// Consumer demand returned.
    Resume,
}

#[derive(Debug, Clone)]
struct OutstandingBatch {
    worker: WorkerId,
    orders: Vec<Order>,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Items written into the stream.
    pub read: u64,
    /// Items whose vote settled.
    pub processed: u64,
    /// Accepted values pushed downstream.
    pub written: u64,
    /// Items still collecting votes.
    pub waiting: usize,
    /// Settled items not yet flushed.
    pub resolved: usize,
    /// Votes currently outstanding.
    pub in_flight_votes: u64,
    /// Batches currently out with workers.
    pub in_flight_batches: usize,
    pub workers: RegistrySummary,
    pub backpressure: bool,
    pub finished: bool,
}

/// The distribution engine.
pub struct Orchestrator<P, R, T, O> {
    ledger: ItemLedger<P, R>,
    registry: ClientRegistry,
    balancer: LoadBalancer,
    transport: T,
    output: O,
    event_bus: Option<SharedEventBus>,
    backpressure: bool,
    written_count: u64,
    finished: bool,
    next_batch: BatchId,
    outstanding: HashMap<BatchId, OutstandingBatch>,
    /// Idle workers waiting for a votable item.
    parked: Vec<WorkerId>,
    /// Idle workers waiting for consumer demand.
    stalled: Vec<WorkerId>,
    queue: VecDeque<Signal>,
}

impl<P, R, T, O> Orchestrator<P, R, T, O>
where
    P: Clone,
    T: Transport<P>,
    O: OutputSink<R>,
{
    /// Build an orchestrator. Fails on invalid configuration.
    pub fn new(
        config: &StreamConfig,
        transport: T,
        output: O,
        equality: EqualityFn<R>,
    ) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            ledger: ItemLedger::new(config.redundancy, equality),
            registry: ClientRegistry::new(),
            balancer: LoadBalancer::new(config.distribution),
            transport,
            output,
            event_bus: None,
            backpressure: false,
            written_count: 0,
            finished: false,
            next_batch: 0,
            outstanding: HashMap::new(),
            parked: Vec::new(),
            stalled: Vec::new(),
            queue: VecDeque::new(),
        })
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    // =========================================================================
    // Upstream
    // =========================================================================

    /// Accept an input payload.
    pub fn write(&mut self, payload: P) -> Order {
        let order = self.ledger.add_item(payload);
        self.publish(|timestamp| StreamEvent::ItemAdded { order, timestamp });
        self.pump();
        order
    }

    /// No more input will arrive.
    pub fn end(&mut self) {
        if self.ledger.input_ended() {
            return;
        }
        self.ledger.end_of_input();
        let items = self.ledger.read_count();
        info!(items, "Input ended");
        self.publish(|timestamp| StreamEvent::InputEnded { items, timestamp });
        // Everything may already be settled, or there was no input at all.
        self.queue.push_back(Signal::Resolved);
        self.pump();
    }

    // =========================================================================
    // Downstream
    // =========================================================================

    /// The consumer is ready for more.
    pub fn demand(&mut self) {
        if self.backpressure {
            self.backpressure = false;
            let written = self.written_count;
            debug!(written, "Backpressure released");
            self.publish(|timestamp| StreamEvent::BackpressureReleased { written, timestamp });
        }
        self.queue.push_back(Signal::Resume);
        self.pump();
    }

    // =========================================================================
    // Transport
    // =========================================================================

    pub fn handle_transport(&mut self, event: TransportEvent<R>) {
        match event {
            TransportEvent::Connected(worker) => self.worker_connected(worker),
            TransportEvent::Disconnected(worker) => self.worker_disconnected(worker),
            TransportEvent::Results {
                worker,
                batch,
                values,
            } => self.deliver_results(worker, batch, values),
        }
    }

    pub fn worker_connected(&mut self, worker: WorkerId) {
        if !self.registry.add(worker) {
            warn!(%worker, "Duplicate connect ignored");
            return;
        }
        self.balancer.initialize_client(&mut self.registry, &worker);
        self.publish(|timestamp| StreamEvent::WorkerConnected { worker, timestamp });
        self.pump();
    }

    pub fn worker_disconnected(&mut self, worker: WorkerId) {
        if self.registry.remove(&worker).is_some() {
            self.pump();
        }
    }

    /// Count a worker's results for a batch and make it available again.
    pub fn deliver_results(&mut self, worker: WorkerId, batch: BatchId, values: Vec<R>) {
        let Some(outstanding) = self.outstanding.remove(&batch) else {
            warn!(%worker, batch, "Results for unknown batch dropped");
            return;
        };
        if outstanding.worker != worker {
            warn!(%worker, batch, owner = %outstanding.worker, "Results from wrong worker dropped");
            self.outstanding.insert(batch, outstanding);
            return;
        }

        self.registry.record_response(&worker, Instant::now());

        let count = values.len();
        if count != outstanding.orders.len() {
            warn!(
                %worker,
                batch,
                expected = outstanding.orders.len(),
                received = count,
                "Result count mismatch"
            );
        }
        self.publish(|timestamp| StreamEvent::ResultsReceived {
            batch,
            worker,
            count,
            timestamp,
        });

        let mut values = values.into_iter();
        for order in outstanding.orders {
            match values.next() {
                Some(value) => self.count_vote(order, worker, value),
                None => {
                    self.ledger.retract(&worker, order);
                }
            }
        }

        self.registry.mark_idle(&worker);
        self.pump();
    }

    fn count_vote(&mut self, order: Order, worker: WorkerId, value: R) {
        match self.ledger.handle_result(order, worker, value) {
            Ok(Verdict::Resolved) => {
                if let Some(item) = self.ledger.get(order) {
                    let votes = item.total_votes();
                    let margin = item.majority_count() - item.runner_up_count();
                    self.publish(|timestamp| StreamEvent::ItemResolved {
                        order,
                        votes,
                        margin,
                        timestamp,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%worker, order, "Result dropped: {}", e),
        }
    }

    // =========================================================================
    // Signal handling
    // =========================================================================

    fn collect_signals(&mut self) {
        let mut refresh = false;
        let mut resolved = false;
        for signal in self.ledger.take_signals() {
            match signal {
                LedgerSignal::NewItem(_) | LedgerSignal::Freed(_) => refresh = true,
                LedgerSignal::Resolved(_) => resolved = true,
            }
        }
        // Registry order matters: a disconnect must be seen before a later
        // availability of the same id.
        for signal in self.registry.take_signals() {
            self.queue.push_back(match signal {
                RegistrySignal::Available(worker) => Signal::Available(worker),
                RegistrySignal::Disconnected(worker) => Signal::Disconnected(worker),
            });
        }
        if refresh && !self.queue.contains(&Signal::Refresh) {
            self.queue.push_back(Signal::Refresh);
        }
        if resolved && !self.queue.contains(&Signal::Resolved) {
            self.queue.push_back(Signal::Resolved);
        }
    }

    fn pump(&mut self) {
        loop {
            self.collect_signals();
            let Some(signal) = self.queue.pop_front() else {
                break;
            };
            match signal {
                Signal::Available(worker) => self.on_available(worker),
                Signal::Disconnected(worker) => self.on_disconnected(worker),
                Signal::Refresh => self.retry_parked(),
                Signal::Resolved => self.drain(),
                Signal::Resume => {
                    for worker in std::mem::take(&mut self.stalled) {
                        self.on_available(worker);
                    }
                    self.drain();
                }
            }
        }
    }

    fn on_available(&mut self, worker: WorkerId) {
        // stale: busy again, or gone
        if !self.registry.is_idle(&worker) {
            return;
        }
        if self.ledger.is_processing_finished() {
            return;
        }
        if self.backpressure {
            if !self.stalled.contains(&worker) {
                self.stalled.push(worker);
            }
            return;
        }

        let size = self.balancer.batch_size(&self.registry, &worker);
        match self.ledger.get_sendable(worker, size) {
            Some(items) => self.dispatch(worker, items),
            None => {
                if !self.parked.contains(&worker) {
                    self.parked.push(worker);
                }
            }
        }
    }

    fn retry_parked(&mut self) {
        if !self.ledger.has_sendable() {
            return;
        }
        for worker in std::mem::take(&mut self.parked) {
            self.on_available(worker);
        }
    }

    fn dispatch(&mut self, worker: WorkerId, items: Vec<(Order, P)>) {
        let id = self.next_batch;
        self.next_batch += 1;

        let (orders, payloads): (Vec<Order>, Vec<P>) = items.into_iter().unzip();
        self.registry.mark_busy(&worker);
        self.registry
            .record_dispatch(&worker, orders.len(), Instant::now());
        self.outstanding.insert(
            id,
            OutstandingBatch {
                worker,
                orders: orders.clone(),
            },
        );

        debug!(%worker, batch = id, size = orders.len(), "Dispatching batch");
        self.publish(|timestamp| StreamEvent::BatchDispatched {
            batch: id,
            worker,
            orders: orders.clone(),
            timestamp,
        });

        let batch = Batch {
            id,
            worker,
            orders,
            payloads,
        };
        if let Err(e) = self.transport.send(batch) {
            warn!(%worker, batch = id, "Send failed, dropping worker: {}", e);
            self.registry.remove(&worker);
        }
    }

    fn on_disconnected(&mut self, worker: WorkerId) {
        let retracted = self.ledger.remove_vote(&worker);
        self.outstanding.retain(|_, batch| batch.worker != worker);
        self.parked.retain(|w| *w != worker);
        self.stalled.retain(|w| *w != worker);
        self.publish(|timestamp| StreamEvent::WorkerDisconnected {
            worker,
            retracted,
            timestamp,
        });
    }

    /// Flush settled items strictly in input order. The terminal sentinel
    /// carries no value, so it goes out even while saturated.
    fn drain(&mut self) {
        while !self.finished {
            if self.backpressure && !self.fully_flushed() {
                break;
            }
            match self.ledger.pop_resolved(self.written_count) {
                Popped::Finished => {
                    self.finished = true;
                    self.parked.clear();
                    self.stalled.clear();
                    self.output.finish();
                    let written = self.written_count;
                    info!(written, "Stream finished");
                    self.publish(|timestamp| StreamEvent::StreamFinished { written, timestamp });
                }
                Popped::Item(item) => {
                    let order = item.order();
                    self.written_count += 1;
                    let Some(value) = item.into_accepted() else {
                        warn!(order, "Resolved item without accepted value");
                        continue;
                    };
                    let accepted = self.output.push(value);
                    self.publish(|timestamp| StreamEvent::ItemFlushed { order, timestamp });
                    if !accepted {
                        self.backpressure = true;
                        let written = self.written_count;
                        debug!(written, "Backpressure applied");
                        self.publish(|timestamp| StreamEvent::BackpressureApplied {
                            written,
                            timestamp,
                        });
                    }
                }
                Popped::Pending => break,
            }
        }
    }

    fn fully_flushed(&self) -> bool {
        self.ledger.is_processing_finished() && self.ledger.resolved_count() == 0
    }

    fn publish(&self, event: impl FnOnce(DateTime<Utc>) -> StreamEvent) {
        if let Some(bus) = self.event_bus.as_ref().filter(|bus| bus.has_subscribers()) {
            bus.publish(event(Utc::now()));
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The terminal sentinel has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressure
    }

    pub fn written_count(&self) -> u64 {
        self.written_count
    }

    pub fn ledger(&self) -> &ItemLedger<P, R> {
        &self.ledger
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            read: self.ledger.read_count(),
            processed: self.ledger.processed_count(),
            written: self.written_count,
            waiting: self.ledger.waiting_count(),
            resolved: self.ledger.resolved_count(),
            in_flight_votes: self.ledger.in_flight_count(),
            in_flight_batches: self.outstanding.len(),
            workers: self.registry.summary(),
            backpressure: self.backpressure,
            finished: self.finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::events::EventBus;
    use crate::item::structural_equality;
    use crate::transport::TransportResult;

    /// Records batches instead of sending them anywhere.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<Batch<u32>>,
        unreachable: Vec<WorkerId>,
    }

    impl Transport<u32> for RecordingTransport {
        fn send(&mut self, batch: Batch<u32>) -> TransportResult<()> {
            if self.unreachable.contains(&batch.worker) {
                return Err(crate::transport::TransportError::WorkerGone(batch.worker));
            }
            self.sent.push(batch);
            Ok(())
        }
    }

    /// Collects output; saturates after `capacity` values until drained.
    struct VecSink {
        values: Vec<u32>,
        finished: bool,
        capacity: usize,
        buffered: usize,
    }

    impl VecSink {
        fn new(capacity: usize) -> Self {
            Self {
                values: Vec::new(),
                finished: false,
                capacity,
                buffered: 0,
            }
        }
    }

    impl OutputSink<u32> for VecSink {
        fn push(&mut self, value: u32) -> bool {
            self.values.push(value);
            self.buffered += 1;
            self.buffered < self.capacity
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    type TestOrchestrator = Orchestrator<u32, u32, RecordingTransport, VecSink>;

    fn orchestrator(config: StreamConfig, capacity: usize) -> TestOrchestrator {
        Orchestrator::new(
            &config,
            RecordingTransport::default(),
            VecSink::new(capacity),
            structural_equality(),
        )
        .unwrap()
    }

    fn worker(n: u128) -> WorkerId {
        WorkerId::from_u128(n)
    }

    /// Take the next batch sent to `w`.
    fn take_batch(orch: &mut TestOrchestrator, w: WorkerId) -> Batch<u32> {
        let sent = &mut orch.transport_mut().sent;
        let index = sent
            .iter()
            .position(|b| b.worker == w)
            .expect("no batch for worker");
        sent.remove(index)
    }

    /// Answer a batch with `f(payload)`.
    fn answer(orch: &mut TestOrchestrator, batch: Batch<u32>, f: impl Fn(u32) -> u32) {
        let values = batch.payloads.iter().map(|p| f(*p)).collect();
        orch.deliver_results(batch.worker, batch.id, values);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let result = Orchestrator::<u32, u32, _, _>::new(
            &StreamConfig::default().with_redundancy(0),
            RecordingTransport::default(),
            VecSink::new(10),
            structural_equality(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_single_worker_happy_path() {
        let mut orch = orchestrator(
            StreamConfig::default().with_distribution(Distribution::chunk(2)),
            100,
        );
        for i in 1..=3 {
            orch.write(i);
        }
        orch.worker_connected(worker(1));
        orch.end();

        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.payloads, vec![1, 2]);
        answer(&mut orch, batch, |p| p * p);

        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.payloads, vec![3]);
        answer(&mut orch, batch, |p| p * p);

        assert_eq!(orch.output().values, vec![1, 4, 9]);
        assert!(orch.output().finished);
        assert!(orch.is_finished());
        assert_eq!(orch.stats().written, 3);
    }

    #[test]
    fn test_worker_waits_for_input() {
        let mut orch = orchestrator(StreamConfig::default(), 100);
        orch.worker_connected(worker(1));
        assert!(orch.transport().sent.is_empty());

        orch.write(5);
        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.orders, vec![0]);
    }

    #[test]
    fn test_empty_input_finishes() {
        let mut orch = orchestrator(StreamConfig::default(), 100);
        orch.end();
        assert!(orch.output().finished);
        assert!(orch.output().values.is_empty());
    }

    #[test]
    fn test_output_in_input_order() {
        let mut orch = orchestrator(StreamConfig::default().with_distribution(Distribution::Single), 100);
        orch.worker_connected(worker(1));
        orch.worker_connected(worker(2));
        orch.write(10);
        orch.write(20);
        orch.end();

        let first = take_batch(&mut orch, worker(1));
        let second = take_batch(&mut orch, worker(2));
        assert_eq!(first.payloads, vec![10]);
        assert_eq!(second.payloads, vec![20]);

        answer(&mut orch, second, |p| p + 1);
        assert!(orch.output().values.is_empty());
        assert_eq!(orch.stats().resolved, 1);

        answer(&mut orch, first, |p| p + 1);
        assert_eq!(orch.output().values, vec![11, 21]);
        assert!(orch.output().finished);
    }

    #[test]
    fn test_redundancy_outvotes_faulty_worker() {
        let mut orch = orchestrator(
            StreamConfig::default()
                .with_redundancy(2)
                .with_distribution(Distribution::Single),
            100,
        );
        for w in 1..=3 {
            orch.worker_connected(worker(w));
        }
        orch.write(7);
        orch.end();

        let b1 = take_batch(&mut orch, worker(1));
        let b2 = take_batch(&mut orch, worker(2));
        // two in flight are enough for a margin of 2
        assert!(orch.transport().sent.is_empty());

        answer(&mut orch, b1, |p| p * 2);
        answer(&mut orch, b2, |_| 0);
        // disagreement: the item is offered to the remaining worker
        let b3 = take_batch(&mut orch, worker(3));
        answer(&mut orch, b3, |p| p * 2);
        assert!(orch.output().values.is_empty());

        // margin still 1; worker 1 already voted, so nobody else can help yet
        assert!(orch.transport().sent.is_empty());
        orch.worker_connected(worker(4));
        let b4 = take_batch(&mut orch, worker(4));
        answer(&mut orch, b4, |p| p * 2);

        assert_eq!(orch.output().values, vec![14]);
        assert!(orch.is_finished());
    }

    #[test]
    fn test_disconnect_readmits_items() {
        let mut orch = orchestrator(StreamConfig::default(), 100);
        orch.worker_connected(worker(1));
        orch.write(3);
        orch.end();
        let lost = take_batch(&mut orch, worker(1));

        orch.worker_disconnected(worker(1));
        assert_eq!(orch.stats().in_flight_votes, 0);
        assert_eq!(orch.stats().in_flight_batches, 0);

        // late results from the departed worker are ignored
        orch.deliver_results(worker(1), lost.id, vec![99]);
        assert!(orch.output().values.is_empty());

        orch.worker_connected(worker(2));
        let batch = take_batch(&mut orch, worker(2));
        answer(&mut orch, batch, |p| p * 3);
        assert_eq!(orch.output().values, vec![9]);
    }

    #[test]
    fn test_send_failure_treated_as_disconnect() {
        let mut orch = orchestrator(StreamConfig::default(), 100);
        orch.transport_mut().unreachable.push(worker(1));
        orch.worker_connected(worker(1));
        orch.write(1);

        assert_eq!(orch.registry().len(), 0);
        assert_eq!(orch.stats().in_flight_votes, 0);

        orch.worker_connected(worker(2));
        assert_eq!(take_batch(&mut orch, worker(2)).orders, vec![0]);
    }

    #[test]
    fn test_short_result_batch_retracts_missing() {
        let mut orch = orchestrator(StreamConfig::default().with_distribution(Distribution::chunk(2)), 100);
        orch.write(1);
        orch.write(2);
        orch.worker_connected(worker(1));
        orch.end();

        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.orders, vec![0, 1]);
        orch.deliver_results(worker(1), batch.id, vec![10]);
        assert_eq!(orch.output().values, vec![10]);

        // the missing item goes back out, to the same worker since its vote was retracted
        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.orders, vec![1]);
        answer(&mut orch, batch, |p| p * 10);
        assert_eq!(orch.output().values, vec![10, 20]);
        assert!(orch.is_finished());
    }

    #[test]
    fn test_backpressure_pauses_flush_and_dispatch() {
        let mut orch = orchestrator(StreamConfig::default().with_distribution(Distribution::Single), 1);
        for i in 0..3 {
            orch.write(i);
        }
        orch.end();
        orch.worker_connected(worker(1));

        let batch = take_batch(&mut orch, worker(1));
        answer(&mut orch, batch, |p| p);
        assert_eq!(orch.output().values, vec![0]);
        assert!(orch.is_backpressured());

        // the batch handed out before saturation still counts
        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.orders, vec![1]);
        answer(&mut orch, batch, |p| p);
        assert_eq!(orch.output().values, vec![0]);
        // the worker went idle while saturated: nothing is dispatched
        assert!(orch.transport().sent.is_empty());

        orch.output_mut().buffered = 0;
        orch.demand();
        let batch = take_batch(&mut orch, worker(1));
        assert_eq!(batch.orders, vec![2]);
        assert_eq!(orch.output().values, vec![0, 1]);
        assert!(orch.is_backpressured());
    }

    #[test]
    fn test_no_flush_during_backpressure_even_if_resolved() {
        let mut orch = orchestrator(StreamConfig::default().with_distribution(Distribution::Single), 1);
        orch.worker_connected(worker(1));
        orch.worker_connected(worker(2));
        orch.write(1);
        orch.write(2);
        orch.end();

        let b1 = take_batch(&mut orch, worker(1));
        let b2 = take_batch(&mut orch, worker(2));
        answer(&mut orch, b1, |p| p);
        assert!(orch.is_backpressured());

        answer(&mut orch, b2, |p| p);
        assert_eq!(orch.output().values, vec![1]);
        assert!(!orch.output().finished);

        // demand alone drains what already resolved
        orch.output_mut().buffered = 0;
        orch.demand();
        assert_eq!(orch.output().values, vec![1, 2]);
        assert!(orch.output().finished);
    }

    #[test]
    fn test_unknown_batch_and_wrong_worker_ignored() {
        let mut orch = orchestrator(StreamConfig::default(), 100);
        orch.worker_connected(worker(1));
        orch.worker_connected(worker(2));
        orch.write(1);
        let batch = take_batch(&mut orch, worker(1));

        orch.deliver_results(worker(1), 999, vec![1]);
        orch.deliver_results(worker(2), batch.id, vec![1]);
        assert_eq!(orch.stats().in_flight_batches, 1);

        orch.deliver_results(worker(1), batch.id, vec![1]);
        assert_eq!(orch.output().values, vec![1]);
    }

    #[test]
    fn test_adaptive_first_batch_uses_default_size() {
        let mut orch = orchestrator(
            StreamConfig::default().with_distribution(Distribution::Adaptive { size: 3 }),
            100,
        );
        for i in 0..10 {
            orch.write(i);
        }
        orch.worker_connected(worker(1));
        assert_eq!(take_batch(&mut orch, worker(1)).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_sizes_follow_measured_speed() {
        use std::time::Duration;

        let mut orch = orchestrator(
            StreamConfig::default().with_distribution(Distribution::Adaptive { size: 4 }),
            100,
        );
        for i in 0..20 {
            orch.write(i);
        }
        orch.worker_connected(worker(1));
        orch.worker_connected(worker(2));
        let fast = take_batch(&mut orch, worker(1));
        let slow = take_batch(&mut orch, worker(2));
        assert_eq!((fast.len(), slow.len()), (4, 4));

        // worker 1: 1ms per item, twice
        tokio::time::advance(Duration::from_millis(4)).await;
        answer(&mut orch, fast, |p| p);
        let fast = take_batch(&mut orch, worker(1));
        assert_eq!(fast.len(), 4);
        tokio::time::advance(Duration::from_millis(4)).await;
        answer(&mut orch, fast, |p| p);
        let fast = take_batch(&mut orch, worker(1));

        // worker 2: 20ms per item, average is now 10.5ms
        tokio::time::advance(Duration::from_millis(72)).await;
        answer(&mut orch, slow, |p| p);
        // 4 + (10.5 - 20) * 4 / 20 = 2.1
        assert_eq!(take_batch(&mut orch, worker(2)).len(), 2);

        // 4 + (10.5 - 1) * 4 / 1 = 42
        let balancer = LoadBalancer::new(Distribution::Adaptive { size: 4 });
        assert_eq!(balancer.batch_size(orch.registry(), &worker(1)), 42);
        assert_eq!(fast.len(), 4);
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::new().shared();
        let mut events = bus.subscribe();
        let mut orch = orchestrator(StreamConfig::default(), 100).with_event_bus(bus);

        orch.worker_connected(worker(1));
        orch.write(2);
        orch.end();
        let batch = take_batch(&mut orch, worker(1));
        answer(&mut orch, batch, |p| p);

        let mut types = Vec::new();
        while let Ok(event) = events.try_recv() {
            types.push(event.event_type());
        }
        assert_eq!(
            types,
            vec![
                "worker_connected",
                "item_added",
                "batch_dispatched",
                "input_ended",
                "results_received",
                "item_resolved",
                "item_flushed",
                "stream_finished",
            ]
        );
    }
}
