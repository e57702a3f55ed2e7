//! Async runtime
//!
//! Runs an [`Orchestrator`] on a single tokio task. The task owns all engine
//! state and multiplexes three sources with `select!`:
//!
//! - producer commands from a [`StreamWriter`]
//! - transport events (connects, disconnects, results)
//! - consumer demand, watched only while the output is saturated
//!
//! The output is an unbounded channel paired with a buffered-value gauge.
//! Values are never refused; the sink reports saturation once
//! `high_water_mark` values are waiting, and demand returns when the
//! [`StreamReader`] takes one out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, StreamConfig};
use crate::events::SharedEventBus;
use crate::item::{structural_equality, EqualityFn};
use crate::orchestrator::{Orchestrator, OutputSink, StreamStats};
use crate::transport::{Transport, TransportEventReceiver};

/// Error type for a running stream
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Stream is no longer accepting input")]
    InputClosed,

    #[error("Output reader dropped before the stream finished")]
    OutputClosed,

    #[error("Transport event channel closed before the stream finished")]
    TransportClosed,
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

enum Input<P> {
    Item(P),
    End,
}

/// Output values waiting in the reader's channel.
struct OutputGauge {
    buffered: AtomicUsize,
    high_water_mark: usize,
    demand: Notify,
}

impl OutputGauge {
    fn new(high_water_mark: usize) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            high_water_mark,
            demand: Notify::new(),
        }
    }

    fn has_room(&self) -> bool {
        self.buffered.load(Ordering::Acquire) < self.high_water_mark
    }

    async fn wait_for_room(&self) {
        loop {
            if self.has_room() {
                return;
            }
            self.demand.notified().await;
        }
    }
}

/// [`OutputSink`] feeding a [`StreamReader`].
pub struct ChannelSink<R> {
    tx: Option<mpsc::UnboundedSender<R>>,
    gauge: Arc<OutputGauge>,
    closed: bool,
}

impl<R> ChannelSink<R> {
    /// The reader is gone.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<R> OutputSink<R> for ChannelSink<R> {
    fn push(&mut self, value: R) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.send(value).is_err() {
            self.closed = true;
            return false;
        }
        let buffered = self.gauge.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        buffered < self.gauge.high_water_mark
    }

    fn finish(&mut self) {
        // dropping the sender ends the reader after the buffered values
        self.tx = None;
    }
}

/// Producer handle.
pub struct StreamWriter<P> {
    tx: mpsc::Sender<Input<P>>,
}

impl<P> StreamWriter<P> {
    /// Append a payload. Waits while the engine's input queue is full.
    pub async fn write(&self, payload: P) -> StreamResult<()> {
        self.tx
            .send(Input::Item(payload))
            .await
            .map_err(|_| StreamError::InputClosed)
    }

    /// Signal end of input. Dropping the writer has the same effect.
    pub async fn end(self) -> StreamResult<()> {
        self.tx
            .send(Input::End)
            .await
            .map_err(|_| StreamError::InputClosed)
    }
}

/// Consumer handle. Yields accepted values in input order.
pub struct StreamReader<R> {
    rx: mpsc::UnboundedReceiver<R>,
    gauge: Arc<OutputGauge>,
}

impl<R> StreamReader<R> {
    /// Next accepted value; `None` once the stream has finished.
    pub async fn next(&mut self) -> Option<R> {
        let value = self.rx.recv().await?;
        self.gauge.buffered.fetch_sub(1, Ordering::AcqRel);
        self.gauge.demand.notify_one();
        Some(value)
    }

    /// Read everything until the stream finishes.
    pub async fn collect(mut self) -> Vec<R> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await {
            values.push(value);
        }
        values
    }
}

/// Handles to a spawned stream.
pub struct StreamHandle<P, R> {
    pub writer: StreamWriter<P>,
    pub reader: StreamReader<R>,
    /// Resolves with final stats once the terminal sentinel is emitted.
    pub task: JoinHandle<StreamResult<StreamStats>>,
}

/// Builder for a distributed stream.
pub struct DistributedStream<R> {
    config: StreamConfig,
    equality: EqualityFn<R>,
    event_bus: Option<SharedEventBus>,
}

impl<R: PartialEq + 'static> DistributedStream<R> {
    /// Results vote by `PartialEq`.
    pub fn new(config: StreamConfig) -> Self {
        Self::with_equality(config, structural_equality())
    }
}

impl<R> DistributedStream<R> {
    /// Results vote by a caller-supplied equality.
    pub fn with_equality(config: StreamConfig, equality: EqualityFn<R>) -> Self {
        Self {
            config,
            equality,
            event_bus: None,
        }
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start the engine on the current tokio runtime. `events` must be the
    /// receiver paired with the transport's event sender.
    pub fn spawn<P, T>(
        self,
        transport: T,
        events: TransportEventReceiver<R>,
    ) -> StreamResult<StreamHandle<P, R>>
    where
        P: Clone + Send + 'static,
        R: Send + 'static,
        T: Transport<P> + 'static,
    {
        let gauge = Arc::new(OutputGauge::new(self.config.high_water_mark));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let sink = ChannelSink {
            tx: Some(out_tx.clone()),
            gauge: Arc::clone(&gauge),
            closed: false,
        };

        let mut orchestrator = Orchestrator::new(&self.config, transport, sink, self.equality)?;
        if let Some(bus) = self.event_bus {
            orchestrator = orchestrator.with_event_bus(bus);
        }

        let (in_tx, in_rx) = mpsc::channel(self.config.high_water_mark);
        info!(
            redundancy = self.config.redundancy,
            distribution = %self.config.distribution,
            high_water_mark = self.config.high_water_mark,
            "Starting distributed stream"
        );

        let task = tokio::spawn(run(orchestrator, in_rx, events, Arc::clone(&gauge), out_tx));

        Ok(StreamHandle {
            writer: StreamWriter { tx: in_tx },
            reader: StreamReader { rx: out_rx, gauge },
            task,
        })
    }
}

async fn run<P, R, T>(
    mut orchestrator: Orchestrator<P, R, T, ChannelSink<R>>,
    mut input: mpsc::Receiver<Input<P>>,
    mut events: TransportEventReceiver<R>,
    gauge: Arc<OutputGauge>,
    output: mpsc::UnboundedSender<R>,
) -> StreamResult<StreamStats>
where
    P: Clone,
    T: Transport<P>,
{
    let mut input_open = true;

    loop {
        if orchestrator.is_finished() {
            let stats = orchestrator.stats();
            info!(
                read = stats.read,
                written = stats.written,
                "Distributed stream finished"
            );
            return Ok(stats);
        }
        if orchestrator.output().is_closed() {
            warn!("Output reader dropped");
            return Err(StreamError::OutputClosed);
        }

        let backpressured = orchestrator.is_backpressured();
        tokio::select! {
            command = input.recv(), if input_open => match command {
                Some(Input::Item(payload)) => {
                    orchestrator.write(payload);
                }
                Some(Input::End) | None => {
                    input_open = false;
                    orchestrator.end();
                }
            },
            event = events.recv() => match event {
                Some(event) => orchestrator.handle_transport(event),
                None => {
                    warn!("Transport event channel closed");
                    return Err(StreamError::TransportClosed);
                }
            },
            _ = gauge.wait_for_room(), if backpressured => orchestrator.demand(),
            _ = output.closed() => {
                warn!("Output reader dropped");
                return Err(StreamError::OutputClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{event_channel, ChannelTransport};
    use crate::types::WorkerId;

    fn sink(high_water_mark: usize) -> (ChannelSink<u32>, StreamReader<u32>) {
        let gauge = Arc::new(OutputGauge::new(high_water_mark));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelSink {
                tx: Some(tx),
                gauge: Arc::clone(&gauge),
                closed: false,
            },
            StreamReader { rx, gauge },
        )
    }

    #[tokio::test]
    async fn test_sink_reports_saturation_and_recovers() {
        let (mut sink, mut reader) = sink(2);
        assert!(sink.push(1));
        assert!(!sink.push(2));
        assert!(!sink.gauge.has_room());

        assert_eq!(reader.next().await, Some(1));
        assert!(sink.gauge.has_room());
        sink.gauge.wait_for_room().await;

        sink.finish();
        assert_eq!(reader.next().await, Some(2));
        assert_eq!(reader.next().await, None);
    }

    #[tokio::test]
    async fn test_sink_detects_dropped_reader() {
        let (mut sink, reader) = sink(4);
        drop(reader);
        assert!(!sink.push(1));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_spawn() {
        let (events, rx) = event_channel::<u32>();
        let transport = ChannelTransport::<u32, u32>::new(events);
        let result = DistributedStream::<u32>::new(StreamConfig::default().with_high_water_mark(0))
            .spawn(transport, rx);
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn test_spawned_stream_round_trip() {
        let (events, rx) = event_channel::<u64>();
        let transport = ChannelTransport::<u64, u64>::new(events);
        let mut link = transport.connect(WorkerId::new()).unwrap();

        let worker = tokio::spawn(async move {
            while let Some(batch) = link.next_batch().await {
                let values = batch.payloads.iter().map(|p| p + 100).collect();
                if link.reply(batch.id, values).is_err() {
                    break;
                }
            }
        });

        let handle = DistributedStream::<u64>::new(StreamConfig::default())
            .spawn(transport, rx)
            .unwrap();
        for i in 0..5 {
            handle.writer.write(i).await.unwrap();
        }
        handle.writer.end().await.unwrap();

        assert_eq!(handle.reader.collect().await, vec![100, 101, 102, 103, 104]);
        let stats = handle.task.await.unwrap().unwrap();
        assert_eq!(stats.written, 5);
        assert!(stats.finished);
        worker.abort();
    }

    #[tokio::test]
    async fn test_dropping_reader_stops_stream() {
        let (events, rx) = event_channel::<u64>();
        let transport = ChannelTransport::<u64, u64>::new(events);
        let handle = DistributedStream::<u64>::new(StreamConfig::default())
            .spawn(transport, rx)
            .unwrap();

        drop(handle.reader);
        let result = handle.task.await.unwrap();
        assert!(matches!(result, Err(StreamError::OutputClosed)));
    }
}
