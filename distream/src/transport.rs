//! Transport boundary
//!
//! The engine never talks to the network itself. A [`Transport`] delivers
//! batches to workers; connection changes and results flow back to the
//! engine as [`TransportEvent`]s through a [`TransportEvents`] handle.
//!
//! [`ChannelTransport`] is an in-process implementation backed by tokio
//! channels, used for simulations and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{Batch, BatchId, WorkerId};

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker {0} is gone")]
    WorkerGone(WorkerId),

    #[error("Event channel closed")]
    EventsClosed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// What a transport reports back to the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent<R> {
    Connected(WorkerId),
    Disconnected(WorkerId),
    /// Results for a batch, positionally aligned with its payloads.
    Results {
        worker: WorkerId,
        batch: BatchId,
        values: Vec<R>,
    },
}

/// Delivers batches to workers.
pub trait Transport<P>: Send {
    /// Hand `batch` to `batch.worker`. An error means the worker cannot be
    /// reached and is treated as a disconnect.
    fn send(&mut self, batch: Batch<P>) -> TransportResult<()>;
}

/// Receiving half of the transport event channel, consumed by the engine.
pub type TransportEventReceiver<R> = mpsc::UnboundedReceiver<TransportEvent<R>>;

/// Sending half of the transport event channel.
pub struct TransportEvents<R> {
    tx: mpsc::UnboundedSender<TransportEvent<R>>,
}

impl<R> Clone for TransportEvents<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Create a transport event channel.
pub fn event_channel<R>() -> (TransportEvents<R>, TransportEventReceiver<R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransportEvents { tx }, rx)
}

impl<R> TransportEvents<R> {
    pub fn send(&self, event: TransportEvent<R>) -> TransportResult<()> {
        self.tx.send(event).map_err(|_| TransportError::EventsClosed)
    }

    pub fn connected(&self, worker: WorkerId) -> TransportResult<()> {
        self.send(TransportEvent::Connected(worker))
    }

    pub fn disconnected(&self, worker: WorkerId) -> TransportResult<()> {
        self.send(TransportEvent::Disconnected(worker))
    }

    pub fn results(&self, worker: WorkerId, batch: BatchId, values: Vec<R>) -> TransportResult<()> {
        self.send(TransportEvent::Results {
            worker,
            batch,
            values,
        })
    }
}

type WorkerChannels<P> = Arc<Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Batch<P>>>>>;

/// In-process transport: each connected worker gets its own batch channel.
pub struct ChannelTransport<P, R> {
    workers: WorkerChannels<P>,
    events: TransportEvents<R>,
}

impl<P, R> Clone for ChannelTransport<P, R> {
    fn clone(&self) -> Self {
        Self {
            workers: Arc::clone(&self.workers),
            events: self.events.clone(),
        }
    }
}

impl<P, R> ChannelTransport<P, R> {
    pub fn new(events: TransportEvents<R>) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<WorkerId, mpsc::UnboundedSender<Batch<P>>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect a new worker and announce it to the engine.
    pub fn connect(&self, worker: WorkerId) -> TransportResult<WorkerLink<P, R>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels().insert(worker, tx);
        self.events.connected(worker)?;
        debug!(%worker, "Worker linked");
        Ok(WorkerLink {
            id: worker,
            batches: rx,
            events: self.events.clone(),
            transport: self.workers.clone(),
        })
    }

    /// Drop a worker's channel and announce the disconnect.
    pub fn disconnect(&self, worker: &WorkerId) -> TransportResult<()> {
        if self.channels().remove(worker).is_some() {
            self.events.disconnected(*worker)?;
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.channels().len()
    }
}

impl<P: Send, R: Send> Transport<P> for ChannelTransport<P, R> {
    fn send(&mut self, batch: Batch<P>) -> TransportResult<()> {
        let worker = batch.worker;
        let mut channels = self.channels();
        let tx = channels
            .get(&worker)
            .ok_or(TransportError::UnknownWorker(worker))?;
        if tx.send(batch).is_err() {
            channels.remove(&worker);
            return Err(TransportError::WorkerGone(worker));
        }
        Ok(())
    }
}

/// Worker side of a [`ChannelTransport`] connection.
pub struct WorkerLink<P, R> {
    id: WorkerId,
    batches: mpsc::UnboundedReceiver<Batch<P>>,
    events: TransportEvents<R>,
    transport: WorkerChannels<P>,
}

impl<P, R> WorkerLink<P, R> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Next batch for this worker; `None` once the link is dropped by the
    /// transport.
    pub async fn next_batch(&mut self) -> Option<Batch<P>> {
        self.batches.recv().await
    }

    /// Return results for a batch.
    pub fn reply(&self, batch: BatchId, values: Vec<R>) -> TransportResult<()> {
        self.events.results(self.id, batch, values)
    }

    /// Leave the transport, announcing the disconnect.
    pub fn disconnect(self) -> TransportResult<()> {
        let removed = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id)
            .is_some();
        if removed {
            self.events.disconnected(self.id)?;
        }
        Ok(())
    }
}
