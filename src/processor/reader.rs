use crate::chunk::Chunk;
use crate::processor::backoff::{retry_with_backoff, RetryBackoff};
use crate::queue::ChunkQueue;
use crate::runtime::config::RunConfig;
use crate::runtime::pipeline::{DatasetSource, FetchOutcome};
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Command sent by the orchestrator to the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderCommand {
    /// Re-fetch the chunk at `offset` for a fresh processing cycle.
    Refetch { offset: u64, len: usize },
}

/// Notice sent by the reader loop to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderNotice {
    /// The sequential scan reached the dataset end; `end_offset` is the total
    /// row count.
    EndOfData { end_offset: u64 },
}

pub(crate) type ReaderCommandSender = mpsc::Sender<ReaderCommand>;

/// The reader loop: one task pulling sequential chunks from the dataset and
/// pushing them into the bounded queue.
///
/// Refetch commands (retry cycles decided by the orchestrator) take priority
/// over sequential progress. After `EndOfData` the loop keeps serving
/// refetches until the command channel closes, which is the orchestrator's
/// signal that no retries remain outstanding.
pub(crate) struct Reader<R> {
    source: Arc<dyn DatasetSource<R>>,
    queue: Arc<ChunkQueue<R>>,
    config: RunConfig,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    command_rx: mpsc::Receiver<ReaderCommand>,
    notice_tx: mpsc::Sender<ReaderNotice>,
}

pub(crate) struct ReaderParams<R> {
    pub source: Arc<dyn DatasetSource<R>>,
    pub queue: Arc<ChunkQueue<R>>,
    pub config: RunConfig,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
    pub command_rx: mpsc::Receiver<ReaderCommand>,
    pub notice_tx: mpsc::Sender<ReaderNotice>,
}

impl<R: Send + 'static> Reader<R> {
    pub(crate) fn new(params: ReaderParams<R>) -> Self {
        Self {
            source: params.source,
            queue: params.queue,
            config: params.config,
            telemetry: params.telemetry,
            shutdown: params.shutdown,
            command_rx: params.command_rx,
            notice_tx: params.notice_tx,
        }
    }

    #[tracing::instrument(name = "reader", skip_all)]
    pub(crate) async fn run(mut self, start_offset: u64) -> Result<()> {
        tracing::info!(start_offset, "reader loop started");

        let mut next_offset = start_offset;
        let mut end_of_data = false;

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested; exiting reader loop");
                break;
            }

            match self.command_rx.try_recv() {
                Ok(ReaderCommand::Refetch { offset, len }) => {
                    if !self.refetch(offset, len).await? {
                        break;
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if end_of_data {
                // Nothing left to scan; park until a refetch arrives or the
                // orchestrator drops the command channel.
                tokio::select! {
                    command = self.command_rx.recv() => match command {
                        Some(ReaderCommand::Refetch { offset, len }) => {
                            if !self.refetch(offset, len).await? {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            // Only pull the next chunk once there is room for it; this keeps
            // the number of fetched-but-uncommitted chunks bounded by
            // queue_capacity + worker_count.
            self.queue.wait_for_capacity().await;

            match self.fetch_with_retry(next_offset, self.config.chunk_size()).await? {
                Some(FetchOutcome::Rows(rows)) if rows.is_empty() => {
                    end_of_data = true;
                    self.announce_end(next_offset).await;
                }
                Some(FetchOutcome::Rows(rows)) => {
                    let fetched = rows.len() as u64;
                    if !self.queue.push(Chunk::new(next_offset, rows)).await {
                        tracing::debug!("chunk queue closed; exiting reader loop");
                        break;
                    }
                    self.telemetry.record_chunk_fetched();
                    next_offset = next_offset.saturating_add(fetched);
                }
                Some(FetchOutcome::EndOfData) => {
                    end_of_data = true;
                    self.announce_end(next_offset).await;
                }
                None => break,
            }
        }

        tracing::info!("reader loop exited");
        Ok(())
    }

    async fn announce_end(&self, end_offset: u64) {
        tracing::info!(end_offset, "dataset end reached");
        let _ = self
            .notice_tx
            .send(ReaderNotice::EndOfData { end_offset })
            .await;
    }

    /// Re-fetches a previously seen chunk and pushes it back into the queue.
    /// Returns `false` when the queue is closed.
    async fn refetch(&self, offset: u64, len: usize) -> Result<bool> {
        tracing::debug!(offset, len, "re-fetching chunk for retry");
        self.queue.wait_for_capacity().await;
        match self.fetch_with_retry(offset, len).await? {
            Some(FetchOutcome::Rows(rows)) if !rows.is_empty() => {
                let enqueued = self.queue.push(Chunk::new(offset, rows)).await;
                if enqueued {
                    self.telemetry.record_chunk_fetched();
                }
                Ok(enqueued)
            }
            Some(_) => {
                // A chunk that existed before must still exist; the source
                // contract requires idempotent reads.
                bail!("dataset returned no rows for previously fetched chunk at offset {offset}")
            }
            None => Ok(false),
        }
    }

    /// One fetch with exponential backoff over transient source errors.
    /// Returns `None` when cancelled mid-retry.
    async fn fetch_with_retry(&self, offset: u64, size: usize) -> Result<Option<FetchOutcome<R>>> {
        let max_attempts = self.config.max_retries() as usize + 1;
        let backoff = RetryBackoff::new(
            self.config.fetch_backoff_initial(),
            self.config.fetch_backoff_max(),
            max_attempts,
        )
        .with_cancellation(&self.shutdown);

        let outcome = retry_with_backoff(
            backoff,
            |_attempt| self.source.fetch(offset, size),
            |attempt, delay, err| {
                self.telemetry.record_fetch_retry();
                tracing::warn!(
                    offset,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient fetch error; backing off"
                );
            },
        )
        .await;

        match outcome {
            Ok(outcome) => Ok(Some(outcome)),
            Err(_) if self.shutdown.is_cancelled() => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "fetch at offset {offset} failed after {max_attempts} attempts",
                )
            }),
        }
    }
}
