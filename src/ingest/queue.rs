//! FIFO of arrived frame paths.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;

#[derive(Debug, Default)]
struct QueueState {
    paths: VecDeque<PathBuf>,
    closed: bool,
}

/// Mutex-guarded FIFO shared between the notification side and the drain tick.
///
/// Once closed the queue stays empty: pushes are refused under the same lock
/// that clears it, so nothing queued around a close can reach a batch.
#[derive(Debug, Default)]
pub struct IngestionQueue {
    state: Mutex<QueueState>,
}

impl IngestionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a path. Returns false if the queue is closed.
    pub fn push(&self, path: PathBuf) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.paths.push_back(path);
        true
    }

    /// Appends several paths, keeping their order. Returns false if the
    /// queue is closed.
    pub fn extend(&self, paths: impl IntoIterator<Item = PathBuf>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.paths.extend(paths);
        true
    }

    /// Removes and returns every queued path in arrival order.
    pub fn drain(&self) -> Vec<PathBuf> {
        self.state.lock().paths.drain(..).collect()
    }

    /// Discards every queued path, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.paths.len();
        state.paths.clear();
        dropped
    }

    /// Discards every queued path and refuses new ones.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.paths.len();
        state.paths.clear();
        dropped
    }

    /// True after [`IngestionQueue::close`].
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Paths waiting.
    pub fn len(&self) -> usize {
        self.state.lock().paths.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.state.lock().paths.is_empty()
    }
}
