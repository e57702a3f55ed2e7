//! Load balancer - batch sizing per worker
//!
//! Decides how many items a worker receives next under one of three
//! policies fixed at construction (see [`Distribution`]).
//!
//! The adaptive policy compares a worker's per-item time on its last
//! completed batch with the fleet average and scales the batch by how many
//! items it could have finished in the average time:
//!
//! ```text
//! next = max(1, round(last + (avg - own) * last / own))
//! ```

use tracing::debug;

use crate::config::Distribution;
use crate::registry::ClientRegistry;
use crate::types::WorkerId;

/// Batch sizing policy.
#[derive(Debug, Clone, Copy)]
pub struct LoadBalancer {
    distribution: Distribution,
}

impl LoadBalancer {
    pub fn new(distribution: Distribution) -> Self {
        Self { distribution }
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Reset a newly connected worker to the zero baseline, so its first
    /// adaptive batch uses the configured size.
    pub fn initialize_client(&self, registry: &mut ClientRegistry, worker: &WorkerId) {
        registry.reset_stats(worker);
    }

    /// How many items to hand `worker` next. Always at least 1.
    pub fn batch_size(&self, registry: &ClientRegistry, worker: &WorkerId) -> usize {
        match self.distribution {
            Distribution::Single => 1,
            Distribution::Chunk { size } => size.max(1),
            Distribution::Adaptive { size } => self.adaptive_size(registry, worker, size.max(1)),
        }
    }

    /// Mean per-item time across workers that have completed a batch.
    pub fn average_per_item_secs(registry: &ClientRegistry) -> Option<f64> {
        let (total, count) = registry
            .records()
            .filter_map(|record| record.load.per_item_secs())
            .fold((0.0, 0usize), |(total, count), secs| (total + secs, count + 1));

        if count == 0 {
            None
        } else {
            Some(total / count as f64)
        }
    }

    fn adaptive_size(&self, registry: &ClientRegistry, worker: &WorkerId, fallback: usize) -> usize {
        let Some(record) = registry.get(worker) else {
            return fallback;
        };
        let Some(own) = record.load.per_item_secs() else {
            return fallback;
        };
        let Some(avg) = Self::average_per_item_secs(registry) else {
            return fallback;
        };
        if own <= 0.0 || avg <= 0.0 {
            return fallback;
        }

        let last = record.load.last_data_count as f64;
        let adapted = (last + (avg - own) * last / own).round();
        let size = if adapted < 1.0 { 1 } else { adapted as usize };

        debug!(
            %worker,
            own_ms = own * 1000.0,
            avg_ms = avg * 1000.0,
            last = record.load.last_data_count,
            size,
            "Adaptive batch size"
        );
        size
    }
}
