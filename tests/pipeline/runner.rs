use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_covers_range, init_tracing, test_config, FlakyTransform, MemorySource, RecordingSink,
    SharedProgressStore,
};
use anyhow::Result;
use chunkline::{Runner, RunnerParams, RunOutcome};
use tokio::time::{sleep, timeout};

fn make_runner(
    total_rows: u64,
    sink: Arc<RecordingSink>,
    store: Arc<SharedProgressStore>,
) -> Runner<u64, u64> {
    Runner::new(RunnerParams {
        source: Arc::new(MemorySource::new(total_rows)),
        transform: Arc::new(FlakyTransform::default()),
        sink,
        progress_store: store,
        config: test_config(100, 2),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_completes_dataset() -> Result<()> {
    init_tracing();
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(SharedProgressStore::default());
    let mut runner = make_runner(1_000, sink.clone(), store);

    let report = timeout(Duration::from_secs(30), runner.run()).await??;

    assert!(report.is_completed());
    assert_eq!(report.committed_offset, 1_000);
    assert_covers_range(&sink.writes(), 0, 1_000)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_run_resumes_on_next_run() -> Result<()> {
    init_tracing();
    let store = Arc::new(SharedProgressStore::default());

    // Stall the first run behind a gated sink, cancel it mid-flight.
    let gated_sink = Arc::new(RecordingSink::gated());
    let mut runner = make_runner(5_000, gated_sink.clone(), store.clone());
    let token = runner.cancellation_token();

    let handle = tokio::spawn(async move { runner.run().await });
    sleep(Duration::from_millis(100)).await;
    token.cancel();
    gated_sink.release();

    let report = timeout(Duration::from_secs(30), handle).await???;
    assert!(matches!(report.outcome, RunOutcome::Aborted(_)));
    let resume_point = report.committed_offset;
    assert!(resume_point < 5_000);
    assert_eq!(store.committed(), resume_point);

    // A fresh runner over the same store finishes the remainder exactly.
    let sink = Arc::new(RecordingSink::new());
    let mut resumed = make_runner(5_000, sink.clone(), store.clone());
    let report = timeout(Duration::from_secs(30), resumed.run()).await??;

    assert!(report.is_completed());
    assert_eq!(report.committed_offset, 5_000);
    assert_covers_range(&sink.writes(), resume_point, 5_000)?;
    Ok(())
}
