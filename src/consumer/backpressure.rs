//! Backpressure control for the poll loop
//!
//! Fetching is paused once the work queue reaches the pause threshold and
//! resumed only after it falls back to the resume threshold. The gap between
//! the two keeps the consumer from flapping around a single watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// What the poll loop should do with its assigned partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    /// Pause every assigned partition
    Pause,
    /// Resume every assigned partition
    Resume,
    /// Leave the current state alone
    Hold,
}

/// Pause/resume hysteresis over work queue occupancy
#[derive(Debug)]
pub struct FlowControl {
    capacity: usize,
    pause_at: usize,
    resume_at: usize,
    paused: AtomicBool,
}

impl FlowControl {
    /// Create a controller for a queue of `capacity` items
    ///
    /// Thresholds are rounded down; the pause threshold is at least one item
    /// and the resume threshold always sits below it.
    pub fn new(capacity: usize, pause_fraction: f64, resume_fraction: f64) -> Self {
        let pause_at = ((capacity as f64 * pause_fraction) as usize).max(1);
        let resume_at = ((capacity as f64 * resume_fraction) as usize).min(pause_at - 1);
        Self {
            capacity,
            pause_at,
            resume_at,
            paused: AtomicBool::new(false),
        }
    }

    /// Decide on a transition for the current occupancy
    ///
    /// Returns `Pause` or `Resume` only on a state change; the caller is
    /// expected to apply it to the broker before the next fetch.
    pub fn evaluate(&self, occupancy: usize) -> FlowDecision {
        let paused = self.paused.load(Ordering::Relaxed);

        if !paused && occupancy >= self.pause_at {
            warn!(
                occupancy,
                capacity = self.capacity,
                "Backpressure threshold reached, pausing fetch"
            );
            self.paused.store(true, Ordering::Relaxed);
            FlowDecision::Pause
        } else if paused && occupancy <= self.resume_at {
            debug!(
                occupancy,
                capacity = self.capacity,
                "Work queue drained, resuming fetch"
            );
            self.paused.store(false, Ordering::Relaxed);
            FlowDecision::Resume
        } else {
            FlowDecision::Hold
        }
    }

    /// Check if fetching is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Occupancy at which fetching pauses
    pub fn pause_threshold(&self) -> usize {
        self.pause_at
    }

    /// Occupancy at which fetching resumes
    pub fn resume_threshold(&self) -> usize {
        self.resume_at
    }

    /// Fraction of the queue in use
    pub fn utilization(&self, occupancy: usize) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        occupancy as f64 / self.capacity as f64
    }
}
