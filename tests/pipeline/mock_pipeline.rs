use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_covers_range, init_tracing, test_config, FlakyTransform, MemorySource, RecordingSink,
    SharedProgressStore,
};
use anyhow::Result;
use chunkline::{ChunkProcessor, ChunkProcessorParams, RunOutcome, RunState};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn processor(
    source: Arc<MemorySource>,
    transform: Arc<FlakyTransform>,
    sink: Arc<RecordingSink>,
    store: Arc<SharedProgressStore>,
    config: chunkline::RunConfig,
) -> ChunkProcessor<u64, u64> {
    ChunkProcessor::new(ChunkProcessorParams {
        source,
        transform,
        sink,
        progress_store: store,
        config,
        shutdown: CancellationToken::new(),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_thousand_rows_across_four_workers() -> Result<()> {
    init_tracing();
    let source = Arc::new(MemorySource::new(10_000));
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(SharedProgressStore::default());
    let mut processor = processor(
        source.clone(),
        Arc::new(FlakyTransform::default()),
        sink.clone(),
        store.clone(),
        test_config(1_000, 4),
    );

    let report = timeout(Duration::from_secs(30), processor.run()).await??;

    assert!(report.is_completed(), "outcome: {:?}", report.outcome);
    assert_eq!(processor.state(), RunState::Completed);
    assert_eq!(report.committed_offset, 10_000);
    assert_eq!(report.stats.rows_transformed, 10_000);
    assert_eq!(source.chunks_fetched(), 10, "one fetch per chunk");
    assert_eq!(sink.writes().len(), 10, "one write per chunk");
    assert_eq!(sink.rows_written(), 10_000);
    assert_covers_range(&sink.writes(), 0, 10_000)?;
    assert_eq!(store.committed(), 10_000);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inflight_chunks_stay_bounded_while_sink_stalls() -> Result<()> {
    init_tracing();
    let source = Arc::new(MemorySource::new(100_000));
    let sink = Arc::new(RecordingSink::gated());
    let store = Arc::new(SharedProgressStore::default());
    let config = test_config(100, 4);
    let bound = config.queue_capacity() + config.worker_count();
    let mut processor = processor(
        source.clone(),
        Arc::new(FlakyTransform::default()),
        sink.clone(),
        store,
        config,
    );

    let handle = tokio::spawn(async move { processor.run().await });

    // With every worker stalled in the sink, the reader fills the queue and
    // then stops pulling from the source.
    sleep(Duration::from_millis(200)).await;
    let fetched_while_stalled = source.chunks_fetched();
    assert!(
        fetched_while_stalled <= bound,
        "fetched {fetched_while_stalled} chunks while stalled, bound is {bound}"
    );

    sink.release();
    let report = timeout(Duration::from_secs(60), handle).await???;
    assert!(report.is_completed());
    assert_eq!(report.committed_offset, 100_000);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_offsets_are_monotonic_chunk_boundaries() -> Result<()> {
    init_tracing();
    let source = Arc::new(MemorySource::new(5_000));
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(SharedProgressStore::default());
    let mut processor = processor(
        source,
        Arc::new(FlakyTransform::default()),
        sink,
        store.clone(),
        test_config(250, 4),
    );

    let report = timeout(Duration::from_secs(30), processor.run()).await??;
    assert!(report.is_completed());

    let saves = store.saves();
    assert!(!saves.is_empty());
    for window in saves.windows(2) {
        assert!(
            window[0] < window[1],
            "saved offsets must be strictly increasing: {saves:?}"
        );
    }
    for offset in &saves {
        assert_eq!(
            offset % 250,
            0,
            "every save lands on a chunk boundary: {saves:?}"
        );
    }
    assert_eq!(saves.last(), Some(&5_000));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_fetch_and_transform_failures_recover() -> Result<()> {
    init_tracing();
    let source = Arc::new(MemorySource::new(2_000));
    source.fail_transiently(0, 2);
    source.fail_transiently(1_000, 1);
    let transform = FlakyTransform::default()
        .fail_retryably(500, 1)
        .fail_retryably(1_500, 2);
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(SharedProgressStore::default());
    let mut processor = processor(
        source,
        Arc::new(transform),
        sink.clone(),
        store,
        test_config(500, 2),
    );

    let report = timeout(Duration::from_secs(30), processor.run()).await??;

    assert!(report.is_completed(), "outcome: {:?}", report.outcome);
    assert_eq!(report.committed_offset, 2_000);
    assert!(report.stats.chunks_retried >= 2);
    assert_covers_range(&sink.writes(), 0, 2_000)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fatal_row_aborts_then_fixed_run_resumes_from_commit() -> Result<()> {
    init_tracing();
    let store = Arc::new(SharedProgressStore::default());

    // First run hits an unrecoverable row at offset 5000.
    let first_sink = Arc::new(RecordingSink::new());
    let mut aborted = processor(
        Arc::new(MemorySource::new(10_000)),
        Arc::new(FlakyTransform::fatal_at(5_000)),
        first_sink.clone(),
        store.clone(),
        test_config(1_000, 4),
    );
    let report = timeout(Duration::from_secs(30), aborted.run()).await??;

    assert_eq!(aborted.state(), RunState::Aborted);
    let cause = match report.outcome {
        RunOutcome::Aborted(cause) => cause,
        RunOutcome::Completed => panic!("run must abort on the fatal row"),
    };
    assert!(
        format!("{cause:?}").contains("unrecoverable row at offset 5000"),
        "cause: {cause:?}"
    );
    // Chunks below the fatal offset were popped in FIFO order before it, so
    // the drain lets them finish and commit; the fatal chunk and everything
    // after it never commit.
    assert_eq!(
        report.committed_offset, 5_000,
        "commit stops exactly at the fatal chunk boundary"
    );
    let resume_point = report.committed_offset;
    assert_eq!(store.committed(), resume_point);

    // Second run with the fixed transform picks up where the commit left
    // off and finishes the dataset.
    let second_sink = Arc::new(RecordingSink::new());
    let mut resumed = processor(
        Arc::new(MemorySource::new(10_000)),
        Arc::new(FlakyTransform::default()),
        second_sink.clone(),
        store.clone(),
        test_config(1_000, 4),
    );
    let report = timeout(Duration::from_secs(30), resumed.run()).await??;

    assert!(report.is_completed(), "outcome: {:?}", report.outcome);
    assert_eq!(report.committed_offset, 10_000);
    assert_covers_range(&second_sink.writes(), resume_point, 10_000)?;
    assert!(
        second_sink
            .writes()
            .iter()
            .all(|(offset, _)| *offset >= resume_point),
        "nothing below the committed offset is re-processed"
    );
    Ok(())
}
