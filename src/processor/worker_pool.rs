//! Worker pool orchestration: task spawning and panic containment.

use crate::processor::worker::{Worker, WorkerParams, WorkerReportSender};
use crate::queue::ChunkQueue;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::pipeline::{ResultSink, RowTransform};
use crate::runtime::telemetry::Telemetry;
use anyhow::anyhow;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct WorkerPoolParams<R, O> {
    pub worker_count: usize,
    pub transform: Arc<dyn RowTransform<R, O>>,
    pub sink: Arc<dyn ResultSink<O>>,
    pub queue: Arc<ChunkQueue<R>>,
    pub report_tx: WorkerReportSender,
    pub telemetry: Arc<Telemetry>,
    pub run_token: CancellationToken,
    pub fatal_handler: Arc<FatalErrorHandler>,
}

impl WorkerPool {
    /// Spawns `worker_count` worker tasks. A worker panic is captured,
    /// reported through the fatal handler, and cancels the run. Each worker
    /// holds a clone of the report sender; the channel closes when the last
    /// worker exits, which is how the orchestrator learns the pool is done.
    pub(crate) fn launch<R: Send + 'static, O: Send + 'static>(
        params: WorkerPoolParams<R, O>,
    ) -> Self {
        let WorkerPoolParams {
            worker_count,
            transform,
            sink,
            queue,
            report_tx,
            telemetry,
            run_token,
            fatal_handler,
        } = params;

        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let worker = Worker::new(
                worker_id,
                WorkerParams {
                    transform: transform.clone(),
                    sink: sink.clone(),
                    queue: queue.clone(),
                    report_tx: report_tx.clone(),
                    telemetry: telemetry.clone(),
                    shutdown: run_token.clone(),
                },
            );

            let run_token = run_token.clone();
            let fatal_handler = fatal_handler.clone();

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                if let Err(panic_payload) = result {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(
                        worker = worker_id,
                        panic = %panic_msg,
                        "worker task panicked"
                    );
                    let context = format!("worker {worker_id} panicked");
                    fatal_handler.trigger_external(
                        context.as_str(),
                        anyhow!("worker {worker_id} panicked: {panic_msg}"),
                    );
                    run_token.cancel();
                }
            });

            handles.push(handle);
        }

        Self { handles }
    }

    /// Joins all worker tasks. Join errors are logged, not propagated: a
    /// panicked worker already surfaced its failure via the fatal handler.
    pub(crate) async fn join(self) {
        let results = join_all(self.handles).await;
        for (idx, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                tracing::warn!(worker = idx, error = %err, "worker task terminated unexpectedly");
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
