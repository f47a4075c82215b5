use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chunkline::{
    init_tracing, DatasetSource, FetchFuture, FetchOutcome, ProgressLoadFuture,
    ProgressSaveFuture, ProgressStore, ResultSink, RowTransform, RunConfig, RunOutcome, Runner,
    RunnerParams, SinkFuture, TransformFuture,
};

const DEFAULT_TOTAL_ROWS: u64 = 1_000_000;
const DEFAULT_CHUNK_SIZE: usize = 10_000;
const DEFAULT_WORKER_COUNT: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let total_rows: u64 = env_or("CHUNKLINE_TOTAL_ROWS", DEFAULT_TOTAL_ROWS)?;
    let chunk_size: usize = env_or("CHUNKLINE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
    let worker_count: usize = env_or("CHUNKLINE_WORKERS", DEFAULT_WORKER_COUNT)?;

    let config = RunConfig::builder()
        .chunk_size(chunk_size)
        .worker_count(worker_count)
        .queue_capacity(worker_count * 2)
        .build()?;

    println!(
        "Processing {total_rows} synthetic rows in chunks of {chunk_size} across {worker_count} workers (Ctrl-C drains)"
    );

    let sink = Arc::new(CountingSink::default());
    let mut runner = Runner::new(RunnerParams {
        source: Arc::new(SyntheticSource { total_rows }),
        transform: Arc::new(ChecksumTransform),
        sink: sink.clone(),
        progress_store: Arc::new(InMemoryProgress::default()),
        config,
    });

    let started = Instant::now();
    let report = runner.run_until_ctrl_c().await?;
    let elapsed = started.elapsed();

    let rows = report.stats.rows_transformed;
    let rate = rows as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    match report.outcome {
        RunOutcome::Completed => println!(
            "Completed: {rows} rows in {elapsed:.2?} ({rate:.0} rows/s), committed offset {}",
            report.committed_offset
        ),
        RunOutcome::Aborted(cause) => println!(
            "Aborted ({cause}): {rows} rows in {elapsed:.2?}, resume offset {}",
            report.committed_offset
        ),
    }
    println!(
        "Sink observed {} rows across {} writes",
        sink.rows.load(Ordering::Relaxed),
        sink.writes.load(Ordering::Relaxed)
    );
    Ok(())
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| anyhow!("invalid value for {name}: {value}")),
        Err(_) => Ok(default),
    }
}

struct SyntheticSource {
    total_rows: u64,
}

impl DatasetSource<u64> for SyntheticSource {
    fn fetch(&self, offset: u64, size: usize) -> FetchFuture<'_, u64> {
        Box::pin(async move {
            if offset >= self.total_rows {
                return Ok(FetchOutcome::EndOfData);
            }
            let end = self.total_rows.min(offset + size as u64);
            Ok(FetchOutcome::Rows((offset..end).collect()))
        })
    }
}

struct ChecksumTransform;

impl RowTransform<u64, u64> for ChecksumTransform {
    fn transform(&self, _offset: u64, row: u64) -> TransformFuture<'_, u64> {
        Box::pin(async move {
            let mut value = row;
            for _ in 0..32 {
                value = value.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(7);
            }
            Ok(value)
        })
    }
}

#[derive(Default)]
struct CountingSink {
    writes: AtomicU64,
    rows: AtomicU64,
}

impl ResultSink<u64> for CountingSink {
    fn write(&self, _offset: u64, outputs: Vec<u64>) -> SinkFuture<'_> {
        Box::pin(async move {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.rows.fetch_add(outputs.len() as u64, Ordering::Relaxed);
            Ok(())
        })
    }
}

#[derive(Default)]
struct InMemoryProgress {
    offset: AtomicU64,
}

impl ProgressStore for InMemoryProgress {
    fn load(&self) -> ProgressLoadFuture<'_> {
        Box::pin(async move { Ok(self.offset.load(Ordering::SeqCst)) })
    }

    fn save(&self, offset: u64) -> ProgressSaveFuture<'_> {
        Box::pin(async move {
            self.offset.store(offset, Ordering::SeqCst);
            Ok(())
        })
    }
}
