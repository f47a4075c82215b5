use crate::queue::ChunkQueue;
use crate::runtime::progress::ProgressTracker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls
/// back to `info`. Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
///
/// Counters are only written by single-writer tasks: the reader records
/// fetch-side counters and the orchestrator folds in worker reports, so the
/// atomics never contend across workers.
#[derive(Default, Debug)]
pub struct Telemetry {
    chunks_fetched: AtomicU64,
    chunks_processed: AtomicU64,
    chunks_retried: AtomicU64,
    rows_transformed: AtomicU64,
    fetch_retries: AtomicU64,
    sink_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_chunk_fetched(&self) {
        self.chunks_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_processed(&self, rows: u64) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.rows_transformed.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_chunk_retry(&self) {
        self.chunks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_fetched(&self) -> u64 {
        self.chunks_fetched.load(Ordering::Relaxed)
    }

    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed.load(Ordering::Relaxed)
    }

    pub fn chunks_retried(&self) -> u64 {
        self.chunks_retried.load(Ordering::Relaxed)
    }

    pub fn rows_transformed(&self) -> u64 {
        self.rows_transformed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            chunks_fetched: self.chunks_fetched.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_retried: self.chunks_retried.load(Ordering::Relaxed),
            rows_transformed: self.rows_transformed.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub chunks_fetched: u64,
    pub chunks_processed: u64,
    pub chunks_retried: u64,
    pub rows_transformed: u64,
    pub fetch_retries: u64,
    pub sink_errors: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth,
/// and the committed offset.
pub fn spawn_metrics_reporter<R: Send + 'static>(
    telemetry: Arc<Telemetry>,
    queue: Arc<ChunkQueue<R>>,
    progress: Arc<ProgressTracker>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "chunkline::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let rows_delta = current_snapshot
                        .rows_transformed
                        .saturating_sub(last_snapshot.rows_transformed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        rows_delta as f64 / elapsed
                    };
                    let queue_chunks = queue.len().await;

                    tracing::info!(
                        target: "chunkline::metrics",
                        rows_per_sec = format!("{throughput:.2}"),
                        rows_transformed = current_snapshot.rows_transformed,
                        chunks_processed = current_snapshot.chunks_processed,
                        chunks_retried = current_snapshot.chunks_retried,
                        queue_chunks,
                        committed_offset = progress.committed(),
                        fetch_retries = current_snapshot.fetch_retries,
                        sink_errors = current_snapshot.sink_errors,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
