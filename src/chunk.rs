use crate::runtime::pipeline::Stage;
use anyhow::Error as AnyError;

/// A bounded, offset-addressed slice of the dataset, the unit of fetch and
/// of processing.
///
/// A chunk is immutable once fetched and is uniquely identified by its
/// starting offset. Within a run, offsets are strictly increasing and
/// non-overlapping: each chunk starts where the previous one ended, except
/// the last, which may be shorter than the configured chunk size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<R> {
    offset: u64,
    rows: Vec<R>,
}

impl<R> Chunk<R> {
    pub fn new(offset: u64, rows: Vec<R>) -> Self {
        Self { offset, rows }
    }

    /// Row index marking the start of this chunk within the full dataset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of rows carried by this chunk.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First offset past this chunk, i.e. where the next chunk starts.
    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.rows.len() as u64)
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<R> {
        self.rows
    }

    /// Bookkeeping view of this chunk, kept by the orchestrator after row
    /// ownership moves into a worker.
    pub fn extent(&self) -> ChunkExtent {
        ChunkExtent {
            offset: self.offset,
            len: self.rows.len() as u64,
        }
    }
}

/// Offset and length of a chunk, without the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExtent {
    pub offset: u64,
    pub len: u64,
}

impl ChunkExtent {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }
}

/// Outcome of processing a single chunk, produced once per chunk by exactly
/// one worker.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Transformation and sink write both succeeded.
    Success { rows_written: usize },
    /// A row transformation or the sink write failed in a way expected to
    /// succeed on a later attempt; `stage` records which one. Retry is the
    /// orchestrator's decision.
    Retryable { stage: Stage, error: AnyError },
    /// The chunk cannot be processed; the run must drain and abort.
    Fatal(AnyError),
}

/// Completion report sent from a worker back to the orchestrator.
#[derive(Debug)]
pub struct WorkerReport {
    pub extent: ChunkExtent,
    pub outcome: ChunkOutcome,
}

impl WorkerReport {
    pub fn new(extent: ChunkExtent, outcome: ChunkOutcome) -> Self {
        Self { extent, outcome }
    }
}
