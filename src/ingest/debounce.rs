//! Cancellable single-shot timer.
//!
//! Re-arming aborts the pending timer task before scheduling a new one, so
//! there is never more than one timer outstanding.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Single-shot timer that fires a callback once the line has been quiet
/// for `interval`.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    runtime: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Creates a debouncer that schedules its timer on `runtime`.
    pub fn new(interval: Duration, runtime: Handle) -> Self {
        Self {
            interval,
            runtime,
            pending: Mutex::new(None),
        }
    }

    /// Quiet interval before the callback fires.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancels any pending timer, then schedules `on_expire` after the interval.
    pub fn arm<F>(&self, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let interval = self.interval;
        let mut pending = self.pending.lock();
        if let Some(task) = pending.take() {
            task.abort();
        }
        *pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            on_expire();
        }));
    }

    /// Cancels the pending timer. Returns true if one was still waiting.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(task) => {
                let was_waiting = !task.is_finished();
                task.abort();
                was_waiting
            }
            None => false,
        }
    }

    /// Returns true while a timer is scheduled and has not fired.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(task) = self.pending.get_mut().take() {
            task.abort();
        }
    }
}
