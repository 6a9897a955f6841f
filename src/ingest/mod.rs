//! Frame arrival handling.
//!
//! File-arrival notifications are queued and coalesced: each notification
//! re-arms a debounce timer, and when the timer expires the whole queue is
//! drained and sent to the pipeline task as one batch. The pipeline then runs
//! the batch through the [`ExposureTracker`].

mod debounce;
mod frame;
mod queue;
mod tracker;

pub use debounce::Debouncer;
pub use frame::{Frame, FrameId, FrameIdError};
pub use queue::IngestionQueue;
pub use tracker::{Classification, ExposureEntry, ExposureState, ExposureTracker};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A drained batch of paths, in arrival order.
pub type Batch = Vec<PathBuf>;

/// Notification side of the pipeline.
///
/// Cheap to call from any thread; processing happens on the task that owns
/// the receiver returned by [`Ingestor::new`].
#[derive(Debug)]
pub struct Ingestor {
    queue: Arc<IngestionQueue>,
    debouncer: Debouncer,
    batches: mpsc::UnboundedSender<Batch>,
}

impl Ingestor {
    /// Creates an ingestor and the receiving end of its batch channel.
    pub fn new(interval: Duration, runtime: Handle) -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ingestor = Self {
            queue: Arc::new(IngestionQueue::new()),
            debouncer: Debouncer::new(interval, runtime),
            batches: tx,
        };
        (ingestor, rx)
    }

    /// Queues a newly arrived path and re-arms the debounce timer.
    pub fn notify(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::trace!(path = %path.display(), "File notify");
        if self.queue.push(path) {
            self.arm();
        }
    }

    /// Queues several paths at once (e.g. files dropped on the viewer).
    pub fn notify_many(&self, paths: impl IntoIterator<Item = PathBuf>) {
        if self.queue.extend(paths) {
            self.arm();
        }
    }

    fn arm(&self) {
        let queue = Arc::clone(&self.queue);
        let batches = self.batches.clone();
        self.debouncer.arm(move || send_batch(&queue, &batches));
    }

    /// Sends whatever is queued right away instead of waiting for the tick.
    pub fn flush(&self) {
        self.debouncer.cancel();
        send_batch(&self.queue, &self.batches);
    }

    /// Cancels the pending tick and discards queued paths without processing them.
    ///
    /// A notification racing with `stop` may still arm the timer, but the
    /// queue is closed by then and the tick finds nothing to send.
    pub fn stop(&self) {
        let dropped = self.queue.close();
        self.debouncer.cancel();
        tracing::info!(discarded = dropped, "Ingestion stopped");
    }

    /// Returns true after [`Ingestor::stop`].
    pub fn is_stopped(&self) -> bool {
        self.queue.is_closed()
    }

    /// Paths waiting for the next tick.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

fn send_batch(queue: &IngestionQueue, batches: &mpsc::UnboundedSender<Batch>) {
    let batch = queue.drain();
    if batch.is_empty() {
        return;
    }
    tracing::debug!(count = batch.len(), "Draining queued frames");
    if batches.send(batch).is_err() {
        tracing::warn!("Pipeline task has gone away; batch dropped");
    }
}
