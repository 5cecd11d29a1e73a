//! Shutdown bookkeeping shared by the poll loop and its workers

use crate::consumer::broker::Wakeup;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// In-flight accounting and stop signals for one topic
///
/// A record is in flight from the moment it is enqueued until its
/// acknowledgement has been drained by the poll loop, or until a worker
/// abandons it during shutdown.
#[derive(Debug)]
pub struct ShutdownState {
    /// Set once stop was requested
    shutting_down: AtomicBool,
    /// Set once the poll loop closed the broker
    shutdown_complete: AtomicBool,
    /// Records enqueued and not yet resolved
    inflight: AtomicUsize,
    /// Observed by the poll loop every iteration
    stop: CancellationToken,
    /// Observed by workers; cancelled only after the drain window
    workers_stop: CancellationToken,
    /// Shutdown initiated timestamp
    shutdown_start: parking_lot::Mutex<Option<Instant>>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            shutdown_complete: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            stop: CancellationToken::new(),
            workers_stop: CancellationToken::new(),
            shutdown_start: parking_lot::Mutex::new(None),
        }
    }

    /// Request the poll loop to stop
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Check if a stop was requested
    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Enter the shutdown sequence
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            *self.shutdown_start.lock() = Some(Instant::now());
            info!(inflight = self.inflight_count(), "Shutdown initiated");
        }
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Token that stops workers from picking up new work or retrying
    pub fn workers_token(&self) -> CancellationToken {
        self.workers_stop.clone()
    }

    /// Signal workers to stop
    pub fn stop_workers(&self) {
        self.workers_stop.cancel();
    }

    /// Mark the shutdown sequence as finished
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        if let Some(elapsed) = self.shutdown_duration() {
            info!(?elapsed, "Shutdown completed");
        }
    }

    /// Check if shutdown is complete
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    /// Count records handed to the work queue
    pub fn add_inflight(&self, count: usize) {
        self.inflight.fetch_add(count, Ordering::AcqRel);
    }

    /// Count records resolved or abandoned
    pub fn remove_inflight(&self, count: usize) {
        let previous = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            })
            .unwrap_or_else(|current| current);
        if previous < count {
            debug!(previous, count, "In-flight counter underflow clamped");
        }
    }

    /// Check if there are any in-flight records
    pub fn has_inflight(&self) -> bool {
        self.inflight_count() > 0
    }

    /// Get the count of in-flight records
    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Get the duration since shutdown started
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.lock().map(|start| start.elapsed())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for stopping a running topic from another thread
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<ShutdownState>,
    waker: Arc<dyn Wakeup>,
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stop_requested", &self.state.stop_requested())
            .finish()
    }
}

impl StopHandle {
    pub(crate) fn new(state: Arc<ShutdownState>, waker: Arc<dyn Wakeup>) -> Self {
        Self { state, waker }
    }

    /// Ask the poll loop to stop and unblock a pending fetch
    pub fn stop(&self) {
        self.state.request_stop();
        self.waker.wakeup();
    }
}
