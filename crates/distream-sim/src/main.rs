//! Simulated worker fleet for distream
//!
//! Spawns in-process workers over a `ChannelTransport`, streams integers
//! through the voting pipeline and prints every accepted value followed by
//! a JSON report.
//!
//! Honest workers square their input. Faulty workers answer `n * n + 1`.
//! Each worker sleeps `delay_ms * (index + 1)` per item, so later workers
//! are slower and the adaptive distribution has something to adapt to.
//!
//! # Usage
//!
//! ```bash
//! distream-sim --workers 5 --items 200 --redundancy 2 --faulty 1
//! distream-sim --distribution adaptive --chunk-size 10 --disconnect-after 3
//! DISTREAM_REDUNDANCY=3 distream-sim --config stream.toml
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use distream::{
    event_channel, ChannelTransport, DistributedStream, Distribution, EventBus, StreamConfig,
    StreamEvent, StreamStats, WorkerId, WorkerLink, DEFAULT_CHUNK_SIZE,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Number of input items
    #[arg(long, default_value_t = 50)]
    items: u64,

    /// Required vote margin (overrides config and DISTREAM_REDUNDANCY)
    #[arg(long)]
    redundancy: Option<u32>,

    /// Batch sizing policy: single, chunk or adaptive
    #[arg(long)]
    distribution: Option<String>,

    /// Batch size for chunk, fallback size for adaptive
    #[arg(long)]
    chunk_size: Option<usize>,

    /// How many workers answer wrongly
    #[arg(long, default_value_t = 0)]
    faulty: usize,

    /// The first worker leaves after this many batches
    #[arg(long)]
    disconnect_after: Option<u64>,

    /// Output values buffered before the reader counts as saturated
    #[arg(long)]
    high_water_mark: Option<usize>,

    /// Per-item work time of the fastest worker, in milliseconds
    #[arg(long, default_value_t = 2)]
    delay_ms: u64,

    /// TOML config file; DISTREAM_* variables and flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every stream event at debug level
    #[arg(long, default_value_t = false)]
    trace_events: bool,
}

/// Final report printed as JSON.
#[derive(Debug, Serialize)]
struct SimReport {
    config: StreamConfig,
    workers: usize,
    faulty: usize,
    stats: StreamStats,
    /// Accepted values equal to the honest answer.
    correct: u64,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct AcceptedValue {
    order: u64,
    value: u64,
}

fn load_config(args: &Args) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            StreamConfig::from_toml_str(&raw)?.with_env_overrides()?
        }
        None => StreamConfig::from_env()?,
    };

    if let Some(redundancy) = args.redundancy {
        config = config.with_redundancy(redundancy);
    }
    if let Some(distribution) = &args.distribution {
        // keep a configured size across a policy switch
        let size = match config.distribution {
            Distribution::Single => DEFAULT_CHUNK_SIZE,
            other => other.size(),
        };
        let distribution: Distribution = distribution.parse()?;
        config = config.with_distribution(distribution.with_size(size));
    }
    if let Some(size) = args.chunk_size {
        config.distribution = config.distribution.with_size(size);
    }
    if let Some(high_water_mark) = args.high_water_mark {
        config = config.with_high_water_mark(high_water_mark);
    }

    config.validate()?;
    Ok(config)
}

async fn run_worker(
    mut link: WorkerLink<u64, u64>,
    index: usize,
    faulty: bool,
    delay: Duration,
    leave_after: Option<u64>,
) {
    let worker = link.id();
    let mut completed = 0u64;

    while let Some(batch) = link.next_batch().await {
        tokio::time::sleep(delay * (index as u32 + 1) * batch.len() as u32).await;

        let values = batch
            .payloads
            .iter()
            .map(|n| if faulty { n * n + 1 } else { n * n })
            .collect();
        if let Err(e) = link.reply(batch.id, values) {
            warn!(%worker, "Reply failed: {}", e);
            return;
        }

        completed += 1;
        if leave_after == Some(completed) {
            info!(%worker, completed, "Worker leaving");
            if let Err(e) = link.disconnect() {
                warn!(%worker, "Disconnect failed: {}", e);
            }
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    if args.workers == 0 {
        bail!("at least one worker is required");
    }
    let leaving = usize::from(args.disconnect_after.is_some());
    let honest = args.workers.saturating_sub(args.faulty + leaving);
    if honest < config.redundancy as usize {
        bail!(
            "{} honest workers cannot reach a vote margin of {}",
            honest,
            config.redundancy
        );
    }

    info!(
        workers = args.workers,
        faulty = args.faulty,
        items = args.items,
        redundancy = config.redundancy,
        distribution = %config.distribution,
        "Simulation starting"
    );

    let (events, events_rx) = event_channel::<u64>();
    let transport = ChannelTransport::<u64, u64>::new(events);

    // faulty workers are the last ones, leaving worker is the first
    let delay = Duration::from_millis(args.delay_ms);
    let mut workers = Vec::with_capacity(args.workers);
    for index in 0..args.workers {
        let link = transport.connect(WorkerId::new())?;
        let faulty = index >= args.workers - args.faulty;
        let leave_after = if index == 0 { args.disconnect_after } else { None };
        workers.push(tokio::spawn(run_worker(link, index, faulty, delay, leave_after)));
    }

    let bus = EventBus::new().shared();
    if args.trace_events {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                log_event(&event);
            }
        });
    }

    let started = Instant::now();
    let handle = DistributedStream::<u64>::new(config.clone())
        .with_event_bus(bus)
        .spawn(transport, events_rx)?;

    let writer = handle.writer;
    let items = args.items;
    let producer = tokio::spawn(async move {
        for n in 0..items {
            writer.write(n).await?;
        }
        writer.end().await
    });

    let mut reader = handle.reader;
    let mut order = 0u64;
    let mut correct = 0u64;
    while let Some(value) = reader.next().await {
        if value == order * order {
            correct += 1;
        }
        println!("{}", serde_json::to_string(&AcceptedValue { order, value })?);
        order += 1;
    }

    producer.await??;
    let stats = handle.task.await??;
    for worker in workers {
        worker.abort();
    }

    let report = SimReport {
        config,
        workers: args.workers,
        faulty: args.faulty,
        stats,
        correct,
        elapsed_ms: started.elapsed().as_millis(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if correct != args.items {
        warn!(correct, items = args.items, "Some accepted values are wrong");
    }
    Ok(())
}

fn log_event(event: &StreamEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!(event_type = event.event_type(), "{}", json),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}
