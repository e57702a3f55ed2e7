//! Client Registry - connected workers, idleness, and round-trip stats
//!
//! Idleness is a flag, not a queue: the registry only announces that a
//! worker became available and leaves it to the orchestrator to act on it.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::WorkerId;

/// Timing of a worker's most recent completed batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    /// When the last completed batch was sent.
    pub last_send_time: Option<Instant>,
    /// When the last completed batch came back.
    pub last_response_time: Option<Instant>,
    /// Size of the last completed batch.
    pub last_data_count: usize,
    /// Batch currently out: send time and size.
    pending: Option<(Instant, usize)>,
}

impl LoadStats {
    /// Seconds per item of the last completed batch, if there was one.
    pub fn per_item_secs(&self) -> Option<f64> {
        let (sent, received) = (self.last_send_time?, self.last_response_time?);
        if self.last_data_count == 0 {
            return None;
        }
        let elapsed = received.saturating_duration_since(sent);
        Some(elapsed.as_secs_f64() / self.last_data_count as f64)
    }

    /// Round trip of the last completed batch.
    pub fn last_round_trip(&self) -> Option<Duration> {
        Some(
            self.last_response_time?
                .saturating_duration_since(self.last_send_time?),
        )
    }

    fn record_send(&mut self, count: usize, at: Instant) {
        self.pending = Some((at, count));
    }

    fn record_response(&mut self, at: Instant) {
        if let Some((sent, count)) = self.pending.take() {
            self.last_send_time = Some(sent);
            self.last_response_time = Some(at);
            self.last_data_count = count;
        }
    }
}

/// A connected worker.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: WorkerId,
    pub idle: bool,
    pub load: LoadStats,
    pub connected_at: Instant,
    /// Batches completed since connecting.
    pub batches_completed: u64,
}

impl ClientRecord {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            idle: true,
            load: LoadStats::default(),
            connected_at: Instant::now(),
            batches_completed: 0,
        }
    }
}

/// Notifications raised by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySignal {
    /// The worker is idle and can take a batch.
    Available(WorkerId),
    /// The worker is gone.
    Disconnected(WorkerId),
}

/// Worker counts for stats snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub connected: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Registry of connected workers.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<WorkerId, ClientRecord>,
    signals: Vec<RegistrySignal>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new idle worker. Re-adding a known worker is a no-op.
    pub fn add(&mut self, worker: WorkerId) -> bool {
        if self.clients.contains_key(&worker) {
            return false;
        }
        self.clients.insert(worker, ClientRecord::new(worker));
        self.signals.push(RegistrySignal::Available(worker));
        info!(%worker, connected = self.clients.len(), "Worker connected");
        true
    }

    /// Deregister a worker.
    pub fn remove(&mut self, worker: &WorkerId) -> Option<ClientRecord> {
        let record = self.clients.remove(worker)?;
        self.signals.push(RegistrySignal::Disconnected(*worker));
        info!(%worker, connected = self.clients.len(), "Worker disconnected");
        Some(record)
    }

    pub fn mark_busy(&mut self, worker: &WorkerId) {
        if let Some(record) = self.clients.get_mut(worker) {
            record.idle = false;
        }
    }

    pub fn mark_idle(&mut self, worker: &WorkerId) {
        if let Some(record) = self.clients.get_mut(worker) {
            record.idle = true;
            self.signals.push(RegistrySignal::Available(*worker));
        }
    }

    /// Note that a batch of `count` items left for `worker` at `at`.
    pub fn record_dispatch(&mut self, worker: &WorkerId, count: usize, at: Instant) {
        if let Some(record) = self.clients.get_mut(worker) {
            record.load.record_send(count, at);
        }
    }

    /// Note that `worker`'s outstanding batch came back at `at`.
    pub fn record_response(&mut self, worker: &WorkerId, at: Instant) {
        if let Some(record) = self.clients.get_mut(worker) {
            record.load.record_response(at);
            record.batches_completed += 1;
            debug!(
                %worker,
                round_trip_ms = record.load.last_round_trip().map(|d| d.as_millis() as u64),
                items = record.load.last_data_count,
                "Batch completed"
            );
        }
    }

    /// Reset a worker's stats to the zero baseline.
    pub fn reset_stats(&mut self, worker: &WorkerId) {
        if let Some(record) = self.clients.get_mut(worker) {
            record.load = LoadStats::default();
        }
    }

    pub fn get(&self, worker: &WorkerId) -> Option<&ClientRecord> {
        self.clients.get(worker)
    }

    pub fn contains(&self, worker: &WorkerId) -> bool {
        self.clients.contains_key(worker)
    }

    pub fn is_idle(&self, worker: &WorkerId) -> bool {
        self.clients.get(worker).is_some_and(|r| r.idle)
    }

    pub fn records(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn summary(&self) -> RegistrySummary {
        let idle = self.clients.values().filter(|r| r.idle).count();
        RegistrySummary {
            connected: self.clients.len(),
            idle,
            busy: self.clients.len() - idle,
        }
    }

    /// Drain pending notifications.
    pub fn take_signals(&mut self) -> Vec<RegistrySignal> {
        std::mem::take(&mut self.signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(n: u128) -> WorkerId {
        WorkerId::from_u128(n)
    }

    #[test]
    fn test_add_announces_availability() {
        let mut registry = ClientRegistry::new();
        assert!(registry.add(worker(1)));
        assert!(!registry.add(worker(1)));
        assert_eq!(
            registry.take_signals(),
            vec![RegistrySignal::Available(worker(1))]
        );
        assert!(registry.is_idle(&worker(1)));
    }

    #[test]
    fn test_busy_idle_cycle() {
        let mut registry = ClientRegistry::new();
        registry.add(worker(1));
        registry.take_signals();

        registry.mark_busy(&worker(1));
        assert!(!registry.is_idle(&worker(1)));
        assert!(registry.take_signals().is_empty());
        assert_eq!(registry.summary().busy, 1);

        registry.mark_idle(&worker(1));
        assert!(registry.is_idle(&worker(1)));
        assert_eq!(
            registry.take_signals(),
            vec![RegistrySignal::Available(worker(1))]
        );
    }

    #[test]
    fn test_remove_announces_disconnect() {
        let mut registry = ClientRegistry::new();
        registry.add(worker(1));
        registry.take_signals();

        assert!(registry.remove(&worker(1)).is_some());
        assert!(registry.remove(&worker(1)).is_none());
        assert_eq!(
            registry.take_signals(),
            vec![RegistrySignal::Disconnected(worker(1))]
        );

        // idling an unknown worker announces nothing
        registry.mark_idle(&worker(1));
        assert!(registry.take_signals().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_stats_track_completed_batch() {
        let mut registry = ClientRegistry::new();
        registry.add(worker(1));
        let t0 = Instant::now();

        registry.record_dispatch(&worker(1), 4, t0);
        assert!(registry.get(&worker(1)).unwrap().load.per_item_secs().is_none());

        registry.record_response(&worker(1), t0 + Duration::from_millis(400));
        let load = registry.get(&worker(1)).unwrap().load;
        assert_eq!(load.last_data_count, 4);
        assert_eq!(load.last_round_trip(), Some(Duration::from_millis(400)));
        assert!((load.per_item_secs().unwrap() - 0.1).abs() < 1e-9);

        // a new dispatch does not disturb the completed stats
        registry.record_dispatch(&worker(1), 8, t0 + Duration::from_millis(500));
        let load = registry.get(&worker(1)).unwrap().load;
        assert_eq!(load.last_data_count, 4);
    }

    #[test]
    fn test_reset_stats() {
        let mut registry = ClientRegistry::new();
        registry.add(worker(1));
        let t0 = Instant::now();
        registry.record_dispatch(&worker(1), 2, t0);
        registry.record_response(&worker(1), t0 + Duration::from_millis(10));
        registry.reset_stats(&worker(1));
        assert_eq!(registry.get(&worker(1)).unwrap().load.last_data_count, 0);
        assert!(registry.get(&worker(1)).unwrap().load.per_item_secs().is_none());
    }

    #[test]
    fn test_summary_counts_idle_and_busy() {
        let mut registry = ClientRegistry::new();
        registry.add(worker(1));
        registry.add(worker(2));
        registry.mark_busy(&worker(2));
        assert!(registry.is_idle(&worker(1)));
        assert!(!registry.is_idle(&worker(2)));
        assert_eq!(
            registry.summary(),
            RegistrySummary {
                connected: 2,
                idle: 1,
                busy: 1
            }
        );
    }
}
