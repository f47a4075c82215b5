use crate::chunk::ChunkExtent;
use std::collections::{BTreeMap, HashMap};

/// Out-of-order completion set with gap-aware frontier advancement.
///
/// Workers finish chunks in arbitrary order, but the committed offset may
/// only advance through contiguous successful offsets. The ledger records
/// successful extents keyed by offset and exposes the frontier: the offset
/// below which every chunk has succeeded. A gap (an unresolved lower offset)
/// blocks advancement past it even when higher offsets already succeeded.
#[derive(Debug)]
pub struct CommitLedger {
    frontier: u64,
    completed: BTreeMap<u64, u64>,
    attempts: HashMap<u64, u32>,
    end_of_data: Option<u64>,
}

impl CommitLedger {
    pub fn new(start_offset: u64) -> Self {
        Self {
            frontier: start_offset,
            completed: BTreeMap::new(),
            attempts: HashMap::new(),
            end_of_data: None,
        }
    }

    /// Offset below which every chunk is successfully processed.
    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Records a successful chunk. Duplicate or already-committed extents are
    /// ignored, which keeps at-least-once worker reports harmless.
    pub fn record_success(&mut self, extent: ChunkExtent) {
        if extent.offset < self.frontier {
            return;
        }
        self.completed.insert(extent.offset, extent.len);
        self.attempts.remove(&extent.offset);
    }

    /// Folds contiguous successes into the frontier. Returns the new frontier
    /// if it moved.
    pub fn advance(&mut self) -> Option<u64> {
        let mut moved = false;
        while let Some(len) = self.completed.remove(&self.frontier) {
            self.frontier = self.frontier.saturating_add(len);
            moved = true;
        }
        moved.then_some(self.frontier)
    }

    /// Increments and returns the retry attempt count for a chunk offset.
    pub fn note_attempt(&mut self, offset: u64) -> u32 {
        let attempts = self.attempts.entry(offset).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// Marks the dataset end offset, reported by the reader on `EndOfData`.
    pub fn set_end_of_data(&mut self, end_offset: u64) {
        self.end_of_data = Some(end_offset);
    }

    pub fn end_of_data(&self) -> Option<u64> {
        self.end_of_data
    }

    /// True once the dataset end is known and every chunk up to it has been
    /// folded into the frontier.
    pub fn is_complete(&self) -> bool {
        matches!(self.end_of_data, Some(end) if self.frontier >= end)
    }
}
