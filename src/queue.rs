use crate::chunk::Chunk;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

struct QueueState<R> {
    chunks: VecDeque<Chunk<R>>,
    closed: bool,
}

/// Bounded FIFO buffer of fetched-but-unprocessed chunks.
///
/// `push` suspends the producer while the queue is full; this is the
/// backpressure mechanism keeping memory bounded when workers fall behind the
/// reader. `pop` suspends consumers while the queue is empty and returns
/// `None` once the queue is closed and drained, so blocked workers wake up
/// instead of deadlocking at shutdown.
pub struct ChunkQueue<R> {
    state: Mutex<QueueState<R>>,
    notify: Notify,
    capacity: usize,
}

impl<R> ChunkQueue<R> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues a chunk, waiting while the queue is at capacity.
    ///
    /// Returns `false` if the queue was closed before the chunk could be
    /// enqueued; the chunk is dropped in that case.
    pub async fn push(&self, chunk: Chunk<R>) -> bool {
        let mut pending = Some(chunk);
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return false;
                }
                if state.chunks.len() < self.capacity {
                    let chunk = pending
                        .take()
                        .expect("chunk should only be enqueued once");
                    state.chunks.push_back(chunk);
                    drop(state);
                    self.notify.notify_waiters();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Dequeues the oldest chunk, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and no chunks remain.
    pub async fn pop(&self) -> Option<Chunk<R>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(chunk) = state.chunks.pop_front() {
                    drop(state);
                    self.notify.notify_waiters();
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Waits until the queue has room for another chunk, or is closed.
    ///
    /// The reader calls this before fetching so a chunk is only pulled from
    /// the source once there is somewhere to put it; with a single producer
    /// the subsequent `push` then never has to buffer an already-fetched
    /// chunk while full.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().await;
                if state.closed || state.chunks.len() < self.capacity {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue: subsequent pushes are rejected and blocked `pop`
    /// calls return `None` once the remaining chunks are drained.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Drops all buffered chunks without closing the queue.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.chunks.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.chunks.is_empty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
