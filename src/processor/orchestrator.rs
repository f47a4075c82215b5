//! The orchestrator: owns the run lifecycle, folds worker reports into the
//! commit ledger, schedules retries, and drives the drain on fatal errors or
//! external cancellation.

use crate::chunk::ChunkOutcome;
use crate::processor::backoff::{retry_with_backoff, RetryBackoff};
use crate::processor::commit::CommitLedger;
use crate::processor::reader::{Reader, ReaderCommand, ReaderNotice, ReaderParams};
use crate::processor::worker_pool::{panic_message, WorkerPool, WorkerPoolParams};
use crate::queue::ChunkQueue;
use crate::runtime::config::RunConfig;
use crate::runtime::fatal::{AbortCause, FatalErrorHandler};
use crate::runtime::pipeline::{
    DatasetSource, PipelineError, ProgressStore, ResultSink, RowTransform, Stage,
};
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry, TelemetrySnapshot};
use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, not yet started.
    Idle,
    /// Reader and workers active, frontier advancing.
    Running,
    /// No new chunks are dispatched; in-flight chunks finish and their
    /// successes still commit.
    Draining,
    /// Every chunk up to the dataset end was committed.
    Completed,
    /// The run stopped early; the committed offset marks the resume point.
    Aborted,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Aborted(AbortCause),
}

/// Summary returned by [`ChunkProcessor::run`].
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Offset below which every chunk is durably committed; a subsequent run
    /// resumes here.
    pub committed_offset: u64,
    pub stats: TelemetrySnapshot,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }
}

/// The chunked parallel batch processor.
///
/// Wires the caller's [`DatasetSource`], [`RowTransform`], [`ResultSink`] and
/// [`ProgressStore`] into a reader task, a bounded chunk queue, a worker pool
/// and a single-writer commit path, then runs the dataset to completion or to
/// the first fatal error.
pub struct ChunkProcessor<R, O> {
    source: Arc<dyn DatasetSource<R>>,
    transform: Arc<dyn RowTransform<R, O>>,
    sink: Arc<dyn ResultSink<O>>,
    progress: Arc<ProgressTracker>,
    config: RunConfig,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    state: RunState,
}

pub struct ChunkProcessorParams<R, O> {
    pub source: Arc<dyn DatasetSource<R>>,
    pub transform: Arc<dyn RowTransform<R, O>>,
    pub sink: Arc<dyn ResultSink<O>>,
    pub progress_store: Arc<dyn ProgressStore>,
    pub config: RunConfig,
    /// Cancelling this token drains the run: in-flight chunks finish and
    /// commit, then the run reports `Aborted` with the committed offset as
    /// the resume point.
    pub shutdown: CancellationToken,
}

impl<R: Send + 'static, O: Send + 'static> ChunkProcessor<R, O> {
    pub fn new(params: ChunkProcessorParams<R, O>) -> Self {
        Self {
            source: params.source,
            transform: params.transform,
            sink: params.sink,
            progress: Arc::new(ProgressTracker::new(params.progress_store)),
            config: params.config,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: params.shutdown,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Last committed offset as observed in memory.
    pub fn committed_offset(&self) -> u64 {
        self.progress.committed()
    }

    /// Swaps in a fresh root token after the previous one was cancelled, so
    /// the owner can start another run.
    pub(crate) fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        self.shutdown = shutdown;
    }

    /// Processes the dataset from the last committed offset.
    ///
    /// Returns `Ok` with a [`RunReport`] whether the run completed or
    /// aborted; `Err` is reserved for failures before the pipeline starts,
    /// such as an unreadable progress store.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.set_state(RunState::Running);

        let start_offset = self
            .progress
            .load()
            .await
            .context("cannot start run without the committed offset")?;
        tracing::info!(
            start_offset,
            chunk_size = self.config.chunk_size(),
            worker_count = self.config.worker_count(),
            queue_capacity = self.config.queue_capacity(),
            "processing run starting"
        );

        let run_token = self.shutdown.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            self.shutdown.clone(),
            run_token.clone(),
        ));
        let queue = Arc::new(ChunkQueue::with_capacity(self.config.queue_capacity()));

        // At most queue_capacity + worker_count chunks are in flight, so a
        // channel of that size never blocks a worker report or a refetch
        // command.
        let channel_capacity = self.config.queue_capacity() + self.config.worker_count();
        let (report_tx, mut report_rx) = mpsc::channel(channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(channel_capacity);
        let (notice_tx, mut notice_rx) = mpsc::channel(1);

        let reader = Reader::new(ReaderParams {
            source: self.source.clone(),
            queue: queue.clone(),
            config: self.config.clone(),
            telemetry: self.telemetry.clone(),
            shutdown: run_token.clone(),
            command_rx,
            notice_tx,
        });
        // The reader runs caller code in `fetch`; panics are contained the
        // same way as in the worker pool so the run still drains.
        let reader_handle = tokio::spawn({
            let fatal_handler = fatal_handler.clone();
            let run_token = run_token.clone();
            async move {
                match AssertUnwindSafe(reader.run(start_offset)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        fatal_handler.trigger(PipelineError::new(Stage::Fetch, err));
                    }
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(panic = %panic_msg, "reader task panicked");
                        fatal_handler.trigger_external(
                            "reader panicked",
                            anyhow!("reader panicked: {panic_msg}"),
                        );
                        run_token.cancel();
                    }
                }
            }
        });

        // `report_tx` moves into the pool; once every worker exits the
        // report channel yields `None` and the event loop ends.
        let pool = WorkerPool::launch(WorkerPoolParams {
            worker_count: self.config.worker_count(),
            transform: self.transform.clone(),
            sink: self.sink.clone(),
            queue: queue.clone(),
            report_tx,
            telemetry: self.telemetry.clone(),
            run_token: run_token.clone(),
            fatal_handler: fatal_handler.clone(),
        });

        let metrics_handle = spawn_metrics_reporter(
            self.telemetry.clone(),
            queue.clone(),
            self.progress.clone(),
            run_token.clone(),
            self.config.metrics_interval(),
        );

        let mut ledger = CommitLedger::new(start_offset);
        let mut command_tx = Some(command_tx);
        let mut draining = false;
        let mut notices_open = true;

        loop {
            tokio::select! {
                report = report_rx.recv() => {
                    let Some(report) = report else {
                        break;
                    };
                    let extent = report.extent;
                    match report.outcome {
                        ChunkOutcome::Success { rows_written } => {
                            self.telemetry.record_chunk_processed(rows_written as u64);
                            ledger.record_success(extent);
                            if let Some(frontier) = ledger.advance() {
                                if let Err(err) = self.commit_frontier(frontier).await {
                                    fatal_handler.trigger(
                                        PipelineError::new(Stage::Progress, err),
                                    );
                                }
                            }
                            if !draining && ledger.is_complete() {
                                tracing::info!(
                                    end_offset = ledger.frontier(),
                                    "dataset fully committed; closing pipeline"
                                );
                                let _ = command_tx.take();
                                queue.close().await;
                            }
                        }
                        ChunkOutcome::Retryable { stage, error } => {
                            if draining {
                                tracing::debug!(
                                    offset = extent.offset,
                                    "dropping chunk retry while draining"
                                );
                            } else if let Some(tx) = command_tx.as_ref() {
                                let attempts = ledger.note_attempt(extent.offset);
                                if attempts > self.config.max_retries() {
                                    let error = error.context(format!(
                                        "chunk at offset {} still failing after {attempts} attempts",
                                        extent.offset,
                                    ));
                                    fatal_handler.trigger(PipelineError::new(stage, error));
                                } else {
                                    self.telemetry.record_chunk_retry();
                                    tracing::warn!(
                                        offset = extent.offset,
                                        attempt = attempts,
                                        error = %error,
                                        "chunk failed; scheduling re-fetch"
                                    );
                                    let command = ReaderCommand::Refetch {
                                        offset: extent.offset,
                                        len: extent.len as usize,
                                    };
                                    if tx.send(command).await.is_err() {
                                        tracing::debug!(
                                            offset = extent.offset,
                                            "reader gone; dropping chunk retry"
                                        );
                                    }
                                }
                            }
                        }
                        ChunkOutcome::Fatal(err) => {
                            fatal_handler.trigger(PipelineError::new(Stage::Transform, err));
                        }
                    }
                }
                notice = notice_rx.recv(), if notices_open => {
                    notices_open = false;
                    if let Some(ReaderNotice::EndOfData { end_offset }) = notice {
                        tracing::info!(end_offset, "dataset end noted");
                        ledger.set_end_of_data(end_offset);
                        if !draining && ledger.is_complete() {
                            // Empty dataset, or every chunk committed before
                            // the end notice arrived.
                            let _ = command_tx.take();
                            queue.close().await;
                        }
                    }
                }
                _ = run_token.cancelled(), if !draining => {
                    draining = true;
                    self.set_state(RunState::Draining);
                    tracing::info!("draining: no new chunks; in-flight chunks finish and commit");
                    let _ = command_tx.take();
                    queue.clear().await;
                    queue.close().await;
                }
            }
        }

        pool.join().await;
        if let Err(err) = reader_handle.await {
            tracing::warn!(error = %err, "reader task terminated unexpectedly");
        }
        run_token.cancel();
        if let Err(err) = metrics_handle.await {
            tracing::warn!(error = %err, "metrics task terminated unexpectedly");
        }

        let committed_offset = self.progress.committed();
        let stats = self.telemetry.snapshot();

        let outcome = if let Some(cause) = fatal_handler.cause() {
            self.set_state(RunState::Aborted);
            RunOutcome::Aborted(cause)
        } else if draining {
            self.set_state(RunState::Aborted);
            RunOutcome::Aborted(AbortCause::new(anyhow!(
                "run cancelled before dataset completion"
            )))
        } else if ledger.is_complete() {
            self.set_state(RunState::Completed);
            RunOutcome::Completed
        } else {
            self.set_state(RunState::Aborted);
            RunOutcome::Aborted(AbortCause::new(anyhow!(
                "workers exited before dataset completion"
            )))
        };

        tracing::info!(
            state = ?self.state,
            committed_offset,
            rows_transformed = stats.rows_transformed,
            chunks_processed = stats.chunks_processed,
            chunks_retried = stats.chunks_retried,
            "processing run finished"
        );

        Ok(RunReport {
            outcome,
            committed_offset,
            stats,
        })
    }

    /// Persists a new frontier, retrying transient store failures with the
    /// configured backoff. Exhaustion is fatal: progress that cannot be
    /// saved would silently grow the re-processing window on resume.
    async fn commit_frontier(&self, offset: u64) -> Result<()> {
        let backoff = RetryBackoff::new(
            self.config.fetch_backoff_initial(),
            self.config.fetch_backoff_max(),
            self.config.max_retries() as usize + 1,
        );
        retry_with_backoff(
            backoff,
            |_attempt| self.progress.commit(offset),
            |attempt, delay, err| {
                tracing::warn!(
                    offset,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "progress save failed; backing off"
                );
            },
        )
        .await
        .with_context(|| format!("failed to commit offset {offset}"))
    }

    fn set_state(&mut self, next: RunState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "run state transition");
            self.state = next;
        }
    }
}
