use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type FetchFuture<'a, R> =
    Pin<Box<dyn Future<Output = Result<FetchOutcome<R>, AnyError>> + Send + 'a>>;
pub type TransformFuture<'a, O> =
    Pin<Box<dyn Future<Output = Result<O, TransformError>> + Send + 'a>>;
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AnyError>> + Send + 'a>>;
pub type ProgressLoadFuture<'a> = Pin<Box<dyn Future<Output = Result<u64, AnyError>> + Send + 'a>>;
pub type ProgressSaveFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AnyError>> + Send + 'a>>;

/// Result of a single batch fetch against the dataset.
#[derive(Debug)]
pub enum FetchOutcome<R> {
    /// Rows for `[offset, offset + rows.len())`. A batch shorter than the
    /// requested size marks the final chunk of the dataset.
    Rows(Vec<R>),
    /// `offset` is at or beyond the dataset end. The sole normal termination
    /// signal for the reader loop.
    EndOfData,
}

/// Offset-addressable bulk-read access to the dataset, supplied by the
/// caller.
///
/// Any offset-addressable mechanism (memory-mapped files, buffered reads,
/// paginated queries) fits behind this trait; the core never touches the
/// underlying storage itself. Implementations must tolerate repeated calls
/// with the same `(offset, size)`, since a transient failure or a chunk
/// retry re-issues the same fetch, and must not buffer unboundedly.
///
/// Every error returned from `fetch` is treated as transient and retried
/// with backoff up to the configured retry budget.
pub trait DatasetSource<R>: Send + Sync {
    fn fetch(&self, offset: u64, size: usize) -> FetchFuture<'_, R>;
}

/// Per-row transformation, supplied by the caller and invoked inside worker
/// tasks. Must be safe to run concurrently across different rows.
pub trait RowTransform<R, O>: Send + Sync {
    /// `offset` is the absolute row index of `row` within the dataset.
    fn transform(&self, offset: u64, row: R) -> TransformFuture<'_, O>;
}

/// Durable write-back target for transformed chunks, supplied by the caller.
///
/// Delivery is at-least-once: a retried chunk calls `write` again with the
/// same offset, so writes must be idempotent per offset.
pub trait ResultSink<O>: Send + Sync {
    fn write(&self, offset: u64, outputs: Vec<O>) -> SinkFuture<'_>;
}

/// Durable record of the lowest offset not yet fully committed; the source
/// of truth for resume-after-restart.
///
/// `save` must flush before returning: a crash right after an unflushed save
/// would let a resumed run skip an offset that was reported committed.
pub trait ProgressStore: Send + Sync {
    /// Last durably committed offset, `0` if none.
    fn load(&self) -> ProgressLoadFuture<'_>;
    fn save(&self, offset: u64) -> ProgressSaveFuture<'_>;
}

/// Error surfaced by a row transformation.
#[derive(Debug)]
pub enum TransformError {
    /// Expected to succeed on a later attempt with no state change required.
    /// The worker reports it and does not retry itself; retry is the
    /// orchestrator's decision so one retry budget covers the whole chunk.
    Retryable(AnyError),
    /// The run cannot safely continue automatically.
    Fatal(AnyError),
}

impl TransformError {
    pub fn retryable(source: impl Into<AnyError>) -> Self {
        Self::Retryable(source.into())
    }

    pub fn fatal(source: impl Into<AnyError>) -> Self {
        Self::Fatal(source.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl core::fmt::Display for TransformError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Retryable(source) => write!(f, "retryable transform error: {source}"),
            Self::Fatal(source) => write!(f, "fatal transform error: {source}"),
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Retryable(source) | Self::Fatal(source) => Some(source.as_ref()),
        }
    }
}

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Transform,
    Sink,
    Progress,
}

/// Error annotated with the pipeline stage it originated from.
#[derive(Debug)]
pub struct PipelineError {
    stage: Stage,
    source: AnyError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} stage error: {}", self.stage, self.source)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn transform_error_classification() {
        let retryable = TransformError::retryable(anyhow!("row locked"));
        assert!(retryable.is_retryable());
        assert!(format!("{retryable}").contains("row locked"));

        let fatal = TransformError::fatal(anyhow!("corrupt chunk"));
        assert!(!fatal.is_retryable());
        assert!(format!("{fatal}").contains("corrupt chunk"));
    }

    #[test]
    fn pipeline_error_carries_stage() {
        let err = PipelineError::new(Stage::Sink, anyhow!("disk full"));
        assert_eq!(err.stage(), Stage::Sink);
        assert!(format!("{err}").contains("Sink stage error"));
        assert!(format!("{}", err.into_source()).contains("disk full"));
    }
}
