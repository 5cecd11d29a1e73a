//! Per-topic consumer counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters updated by the poll loop and its workers
#[derive(Debug)]
pub struct ConsumerMetrics {
    records_fetched: AtomicU64,
    records_enqueued: AtomicU64,
    queue_full: AtomicU64,
    records_acked: AtomicU64,
    handler_failures: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    pauses: AtomicU64,
    resumes: AtomicU64,
    rebalances: AtomicU64,
    start_time: Instant,
}

macro_rules! counter {
    ($($(#[$doc:meta])* $name:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ConsumerMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            records_fetched: AtomicU64::new(0),
            records_enqueued: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            records_acked: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
            rebalances: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    counter! {
        /// A record came back from a fetch
        increment_fetched => records_fetched;
        /// A record was pushed to the work queue
        increment_enqueued => records_enqueued;
        /// A push was deferred because the queue was full
        increment_queue_full => queue_full;
        /// A worker acknowledged a record
        increment_acked => records_acked;
        /// A handler reported failure
        increment_failures => handler_failures;
        /// A record is being retried
        increment_retries => retries;
        /// A record used up its retry budget
        increment_exhausted => exhausted;
        /// An offset commit succeeded or was queued
        increment_commits => commits;
        /// An offset commit failed
        increment_commit_failures => commit_failures;
        /// Fetching was paused
        increment_pauses => pauses;
        /// Fetching was resumed
        increment_resumes => resumes;
        /// An assign or revoke event was handled
        increment_rebalances => rebalances;
    }

    /// Records acknowledged per second since creation
    pub fn acked_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.records_acked.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            records_acked: self.records_acked.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ConsumerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub records_fetched: u64,
    pub records_enqueued: u64,
    pub queue_full: u64,
    pub records_acked: u64,
    pub handler_failures: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub pauses: u64,
    pub resumes: u64,
    pub rebalances: u64,
}
