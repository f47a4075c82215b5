use crate::runtime::pipeline::ProgressStore;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Single-writer wrapper over the caller's [`ProgressStore`].
///
/// Keeps an in-memory copy of the committed offset for cheap reads by
/// observers (metrics, tests); the durable store remains the source of truth
/// for resume-after-restart. Only the orchestrator calls `commit`, so no
/// locking is needed beyond the store's own flush discipline.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    committed: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self {
            store,
            committed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Loads the last durably committed offset at startup and seeds the
    /// in-memory value with it.
    pub async fn load(&self) -> Result<u64> {
        let offset = self
            .store
            .load()
            .await
            .context("failed to load committed offset")?;
        self.committed.store(offset, Ordering::SeqCst);
        Ok(offset)
    }

    /// Durably records that all chunks below `offset` are fully processed.
    ///
    /// The store write completes before the new value is published, so a
    /// crash between the two can only under-report progress, never skip an
    /// uncommitted offset on resume. Valid to call only with offsets at or
    /// above the current committed offset.
    pub async fn commit(&self, offset: u64) -> Result<()> {
        let current = self.committed.load(Ordering::SeqCst);
        debug_assert!(
            offset >= current,
            "commit must be monotonic: {offset} < {current}"
        );

        self.store
            .save(offset)
            .await
            .with_context(|| format!("failed to persist committed offset {offset}"))?;
        self.committed.store(offset, Ordering::SeqCst);
        Ok(())
    }

    /// Last committed offset as observed in memory.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}
