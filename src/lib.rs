pub mod chunk;
pub mod processor;
pub mod queue;
pub mod runtime;

pub use chunk::{Chunk, ChunkExtent, ChunkOutcome, WorkerReport};
pub use processor::commit::CommitLedger;
pub use processor::orchestrator::{
    ChunkProcessor, ChunkProcessorParams, RunOutcome, RunReport, RunState,
};
pub use queue::ChunkQueue;
pub use runtime::config::{RunConfig, RunConfigBuilder, RunConfigParams};
pub use runtime::fatal::AbortCause;
pub use runtime::pipeline::{
    DatasetSource, FetchFuture, FetchOutcome, PipelineError, ProgressLoadFuture,
    ProgressSaveFuture, ProgressStore, ResultSink, RowTransform, SinkFuture, Stage,
    TransformError, TransformFuture,
};
pub use runtime::progress::ProgressTracker;
pub use runtime::runner::{Runner, RunnerParams};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
