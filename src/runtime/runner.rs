use crate::processor::orchestrator::{ChunkProcessor, ChunkProcessorParams, RunReport};
use crate::runtime::config::RunConfig;
use crate::runtime::pipeline::{DatasetSource, ProgressStore, ResultSink, RowTransform};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the processor lifecycle and handles OS signals for graceful
/// shutdowns.
pub struct Runner<R, O> {
    processor: ChunkProcessor<R, O>,
    shutdown: CancellationToken,
}

pub struct RunnerParams<R, O> {
    pub source: Arc<dyn DatasetSource<R>>,
    pub transform: Arc<dyn RowTransform<R, O>>,
    pub sink: Arc<dyn ResultSink<O>>,
    pub progress_store: Arc<dyn ProgressStore>,
    pub config: RunConfig,
}

impl<R: Send + 'static, O: Send + 'static> Runner<R, O> {
    /// Creates a new runner and wires a root [`CancellationToken`] that
    /// propagates through the entire pipeline (reader, workers, queue,
    /// commit path).
    pub fn new(params: RunnerParams<R, O>) -> Self {
        let shutdown = CancellationToken::new();
        let processor = ChunkProcessor::new(ChunkProcessorParams {
            source: params.source,
            transform: params.transform,
            sink: params.sink,
            progress_store: params.progress_store,
            config: params.config,
            shutdown: shutdown.clone(),
        });
        Self {
            processor,
            shutdown,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can
    /// integrate with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn processor(&self) -> &ChunkProcessor<R, O> {
        &self.processor
    }

    /// Runs the dataset to completion, or until the shutdown token is
    /// cancelled elsewhere.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.processor.run().await
    }

    /// Runs until completion or until a Ctrl-C (SIGINT) is received; the
    /// signal drains the run gracefully so the report carries a valid resume
    /// point.
    pub async fn run_until_ctrl_c(&mut self) -> Result<RunReport> {
        let shutdown = self.shutdown.clone();
        let signal_task = tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("Ctrl-C received; draining run");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });

        let report = self.processor.run().await;

        // Release the signal task whichever way the run ended, then rearm
        // the token so the runner can be reused.
        self.shutdown.cancel();
        let _ = signal_task.await;
        self.reinitialize_shutdown_token();

        report
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.processor.replace_shutdown_root(self.shutdown.clone());
    }
}
