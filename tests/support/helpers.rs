use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail};
use chunkline::{
    DatasetSource, FetchFuture, FetchOutcome, ProgressLoadFuture, ProgressSaveFuture,
    ProgressStore, ResultSink, RowTransform, RunConfig, SinkFuture, TransformError,
    TransformFuture,
};
use tokio::sync::Semaphore;

pub fn init_tracing() {
    chunkline::init_tracing();
}

pub fn test_config(chunk_size: usize, worker_count: usize) -> RunConfig {
    RunConfig::builder()
        .chunk_size(chunk_size)
        .worker_count(worker_count)
        .queue_capacity(worker_count * 2)
        .max_retries(2)
        .fetch_backoff_initial(Duration::from_millis(1))
        .fetch_backoff_max(Duration::from_millis(4))
        .metrics_interval(Duration::from_secs(60))
        .build()
        .expect("test config should validate")
}

/// Dataset of `total_rows` sequential `u64` rows with scripted transient
/// fetch failures.
pub struct MemorySource {
    total_rows: u64,
    chunks_fetched: AtomicUsize,
    transient_failures: Mutex<HashMap<u64, usize>>,
}

impl MemorySource {
    pub fn new(total_rows: u64) -> Self {
        Self {
            total_rows,
            chunks_fetched: AtomicUsize::new(0),
            transient_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_transiently(&self, offset: u64, times: usize) {
        self.transient_failures.lock().unwrap().insert(offset, times);
    }

    /// Number of successful chunk fetches, i.e. chunks handed to the
    /// pipeline.
    pub fn chunks_fetched(&self) -> usize {
        self.chunks_fetched.load(Ordering::SeqCst)
    }
}

impl DatasetSource<u64> for MemorySource {
    fn fetch(&self, offset: u64, size: usize) -> FetchFuture<'_, u64> {
        Box::pin(async move {
            {
                let mut failures = self.transient_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&offset) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(anyhow!("source temporarily unavailable at {offset}"));
                    }
                }
            }
            if offset >= self.total_rows {
                return Ok(FetchOutcome::EndOfData);
            }
            let end = self.total_rows.min(offset + size as u64);
            self.chunks_fetched.fetch_add(1, Ordering::SeqCst);
            Ok(FetchOutcome::Rows((offset..end).collect()))
        })
    }
}

/// Doubles each row, with scripted retryable failures and an optional fatal
/// row.
#[derive(Default)]
pub struct FlakyTransform {
    retryable_failures: Mutex<HashMap<u64, usize>>,
    fatal_at: Option<u64>,
}

impl FlakyTransform {
    pub fn fatal_at(offset: u64) -> Self {
        Self {
            retryable_failures: Mutex::new(HashMap::new()),
            fatal_at: Some(offset),
        }
    }

    pub fn fail_retryably(self, offset: u64, times: usize) -> Self {
        self.retryable_failures.lock().unwrap().insert(offset, times);
        self
    }
}

impl RowTransform<u64, u64> for FlakyTransform {
    fn transform(&self, offset: u64, row: u64) -> TransformFuture<'_, u64> {
        Box::pin(async move {
            if self.fatal_at == Some(offset) {
                return Err(TransformError::fatal(anyhow!(
                    "unrecoverable row at offset {offset}"
                )));
            }
            let mut failures = self.retryable_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&offset) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransformError::retryable(anyhow!(
                        "row {offset} temporarily locked"
                    )));
                }
            }
            Ok(row * 2)
        })
    }
}

/// Records every write; optionally gated so writes block until released,
/// which lets tests freeze the workers and observe backpressure.
pub struct RecordingSink {
    writes: Mutex<Vec<(u64, Vec<u64>)>>,
    gate: Semaphore,
    gated: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            gated: AtomicBool::new(false),
        }
    }

    pub fn gated() -> Self {
        let sink = Self::new();
        sink.gated.store(true, Ordering::SeqCst);
        sink
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn writes(&self) -> Vec<(u64, Vec<u64>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn rows_written(&self) -> u64 {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, rows)| rows.len() as u64)
            .sum()
    }
}

impl ResultSink<u64> for RecordingSink {
    fn write(&self, offset: u64, outputs: Vec<u64>) -> SinkFuture<'_> {
        Box::pin(async move {
            if self.gated.load(Ordering::SeqCst) {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| anyhow!("sink gate closed"))?;
                permit.forget();
            }
            self.writes.lock().unwrap().push((offset, outputs));
            Ok(())
        })
    }
}

/// In-memory progress store recording every save, shareable across runs to
/// exercise resume-after-abort.
#[derive(Default)]
pub struct SharedProgressStore {
    offset: AtomicU64,
    saves: Mutex<Vec<u64>>,
}

impl SharedProgressStore {
    pub fn saves(&self) -> Vec<u64> {
        self.saves.lock().unwrap().clone()
    }

    pub fn committed(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }
}

impl ProgressStore for SharedProgressStore {
    fn load(&self) -> ProgressLoadFuture<'_> {
        Box::pin(async move { Ok(self.offset.load(Ordering::SeqCst)) })
    }

    fn save(&self, offset: u64) -> ProgressSaveFuture<'_> {
        Box::pin(async move {
            self.offset.store(offset, Ordering::SeqCst);
            self.saves.lock().unwrap().push(offset);
            Ok(())
        })
    }
}

/// Asserts that the recorded writes cover exactly `[start, end)` with no
/// gaps and no overlap, in any completion order.
pub fn assert_covers_range(writes: &[(u64, Vec<u64>)], start: u64, end: u64) -> anyhow::Result<()> {
    let mut sorted: Vec<(u64, u64)> = writes
        .iter()
        .map(|(offset, rows)| (*offset, rows.len() as u64))
        .collect();
    sorted.sort_unstable();

    let mut cursor = start;
    for (offset, len) in sorted {
        if offset != cursor {
            bail!("expected chunk at offset {cursor}, found {offset}");
        }
        cursor += len;
    }
    if cursor != end {
        bail!("coverage stops at {cursor}, expected {end}");
    }
    Ok(())
}
