//! Progress reporting for batch artwork fetches.
//!
//! The browser shows a "loading covers m/n" indicator, fed by a pair of
//! counters: `requested` grows on every `get_image` call, `completed` on
//! every terminal outcome. A misbehaving listener must never break a
//! download, so callback panics are caught and logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::warn;

pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Default)]
pub struct ProgressTracker {
    requested: AtomicUsize,
    completed: AtomicUsize,
    callback: Mutex<Option<ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the listener, replacing any previous one.
    pub fn set_callback(&self, callback: ProgressCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.lock().unwrap() = None;
    }

    /// Record that a request entered the pipeline.
    pub fn request_started(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    /// Record a terminal outcome (success, failure, or cancellation).
    pub fn request_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    /// Current (completed, total) pair.
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.completed.load(Ordering::SeqCst),
            self.requested.load(Ordering::SeqCst),
        )
    }

    fn notify(&self) {
        let (completed, total) = self.snapshot();
        let callback = self.callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            let result = catch_unwind(AssertUnwindSafe(|| cb(completed, total)));
            if result.is_err() {
                warn!("progress listener panicked, ignoring");
            }
        }
    }
}
