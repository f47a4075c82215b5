use crate::chunk::{Chunk, ChunkOutcome, WorkerReport};
use crate::queue::ChunkQueue;
use crate::runtime::pipeline::{ResultSink, RowTransform, Stage, TransformError};
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) type WorkerReportSender = mpsc::Sender<WorkerReport>;

/// One executor of the worker pool.
///
/// Pops a chunk, applies the transformation row by row, writes the outputs
/// to the sink, then reports the outcome to the orchestrator. Stateless
/// between chunks. Cancellation is observed only between chunks: a started
/// chunk runs to completion so the sink never sees a partially-applied
/// chunk.
pub(crate) struct Worker<R, O> {
    pub id: usize,
    transform: Arc<dyn RowTransform<R, O>>,
    sink: Arc<dyn ResultSink<O>>,
    queue: Arc<ChunkQueue<R>>,
    report_tx: WorkerReportSender,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

pub(crate) struct WorkerParams<R, O> {
    pub transform: Arc<dyn RowTransform<R, O>>,
    pub sink: Arc<dyn ResultSink<O>>,
    pub queue: Arc<ChunkQueue<R>>,
    pub report_tx: WorkerReportSender,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
}

impl<R: Send + 'static, O: Send + 'static> Worker<R, O> {
    pub(crate) fn new(id: usize, params: WorkerParams<R, O>) -> Self {
        Self {
            id,
            transform: params.transform,
            sink: params.sink,
            queue: params.queue,
            report_tx: params.report_tx,
            telemetry: params.telemetry,
            shutdown: params.shutdown,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub(crate) async fn run(self) {
        tracing::debug!(worker = self.id, "worker task started");

        loop {
            let chunk = tokio::select! {
                chunk = self.queue.pop() => chunk,
                _ = self.shutdown.cancelled() => {
                    // Drain whatever is still ready without blocking; the
                    // orchestrator clears the queue on abort.
                    break;
                }
            };

            let Some(chunk) = chunk else {
                tracing::debug!(worker = self.id, "chunk queue closed; exiting worker loop");
                break;
            };

            let extent = chunk.extent();
            let outcome = self.process_chunk(chunk).await;
            if self.report_tx.send(WorkerReport::new(extent, outcome)).await.is_err() {
                tracing::debug!(worker = self.id, "report channel closed; exiting worker loop");
                break;
            }
        }

        tracing::debug!(worker = self.id, "worker task exited");
    }

    /// Transforms every row of the chunk, then writes the outputs to the
    /// sink. The first row failure abandons the rest of the chunk: a retry
    /// re-processes the whole chunk, and the sink's idempotency contract
    /// absorbs the duplicate write.
    async fn process_chunk(&self, chunk: Chunk<R>) -> ChunkOutcome {
        let offset = chunk.offset();
        let mut outputs = Vec::with_capacity(chunk.len());

        for (index, row) in chunk.into_rows().into_iter().enumerate() {
            let row_offset = offset.saturating_add(index as u64);
            match self.transform.transform(row_offset, row).await {
                Ok(output) => outputs.push(output),
                Err(TransformError::Retryable(err)) => {
                    tracing::warn!(
                        worker = self.id,
                        chunk_offset = offset,
                        row_offset,
                        error = %err,
                        "retryable transform error; abandoning chunk"
                    );
                    return ChunkOutcome::Retryable {
                        stage: Stage::Transform,
                        error: err.context(format!("transform failed at row {row_offset}")),
                    };
                }
                Err(TransformError::Fatal(err)) => {
                    tracing::error!(
                        worker = self.id,
                        chunk_offset = offset,
                        row_offset,
                        error = %err,
                        "fatal transform error"
                    );
                    return ChunkOutcome::Fatal(
                        err.context(format!("transform failed at row {row_offset}")),
                    );
                }
            }
        }

        let rows_written = outputs.len();
        match self.sink.write(offset, outputs).await {
            Ok(()) => ChunkOutcome::Success { rows_written },
            Err(err) => {
                self.telemetry.record_sink_error();
                tracing::warn!(
                    worker = self.id,
                    chunk_offset = offset,
                    error = %err,
                    "sink write failed; chunk will be retried"
                );
                ChunkOutcome::Retryable {
                    stage: Stage::Sink,
                    error: err.context(format!("sink write failed for chunk at offset {offset}")),
                }
            }
        }
    }
}
