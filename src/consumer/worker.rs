//! Worker pool draining a topic's work queue
//!
//! Each worker resolves one record completely before taking the next. A
//! record moves through a small state machine:
//!
//! ```text
//! Pending -> (handler) -> Acked
//!                      -> Retrying(n) -> (backoff) -> handler again
//!                      -> Exhausted(n)
//! Retrying(n) -> (stop during backoff) -> Abandoned
//! ```
//!
//! `Acked` and `Exhausted` both emit an acknowledgement. `Abandoned` does not:
//! the record stays uncommitted and will be redelivered.

use crate::consumer::dispatcher::Dispatcher;
use crate::consumer::metrics::ConsumerMetrics;
use crate::consumer::queue::{AckSender, WorkItem, WorkQueue};
use crate::consumer::record::Record;
use crate::consumer::retry::{Admission, RetryLedger, RetryPolicy};
use crate::consumer::shutdown::ShutdownState;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where a single record is in its processing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Not yet handled
    Pending,
    /// Failed and waiting for another attempt
    Retrying {
        /// Failures so far
        failures: u32,
    },
    /// Handled successfully, or failed on a topic without local retry
    Acked,
    /// Retry budget used up; acknowledged anyway
    Exhausted {
        /// Failures recorded
        failures: u32,
    },
    /// Dropped by a stop signal while waiting to retry
    Abandoned,
}

/// Everything a worker needs, shared by all workers of a topic
#[derive(Clone)]
pub struct WorkerContext {
    /// Topic served by this pool
    pub topic: String,
    /// Source of records
    pub queue: WorkQueue,
    /// Sink for acknowledgements
    pub acks: AckSender,
    /// Handler routing
    pub dispatcher: Arc<Dispatcher>,
    /// Failure counts shared across workers
    pub ledger: Arc<RetryLedger>,
    /// Retry policy for this topic
    pub policy: RetryPolicy,
    /// Stop signal and in-flight accounting
    pub shutdown: Arc<ShutdownState>,
    /// Counters
    pub metrics: Arc<ConsumerMetrics>,
}

impl WorkerContext {
    /// Run handler attempts for one record until it resolves
    pub async fn process(&self, record: Record, stop: &CancellationToken) -> RecordState {
        let key = record.key_id();
        let mut state = RecordState::Pending;

        loop {
            state = match state {
                RecordState::Pending | RecordState::Retrying { .. } => {
                    let succeeded = self.dispatcher.dispatch(&record).await;
                    if !succeeded {
                        self.metrics.increment_failures();
                    }

                    match self.ledger.admit(&key, succeeded, &self.policy) {
                        Admission::Acked | Admission::OptedOut => RecordState::Acked,
                        Admission::Exhausted { failures } => {
                            self.metrics.increment_exhausted();
                            RecordState::Exhausted { failures }
                        }
                        Admission::Retry { failures } => {
                            self.metrics.increment_retries();
                            self.backoff(failures, stop).await
                        }
                    }
                }
                RecordState::Acked | RecordState::Exhausted { .. } => {
                    if self.acks.send(record.ack()) {
                        self.metrics.increment_acked();
                    } else {
                        debug!(record = %key, "Poll loop gone, acknowledgement dropped");
                        self.shutdown.remove_inflight(1);
                    }
                    return state;
                }
                RecordState::Abandoned => {
                    debug!(record = %key, "Retry abandoned on stop");
                    self.ledger.forget(&key);
                    self.shutdown.remove_inflight(1);
                    return state;
                }
            };
        }
    }

    async fn backoff(&self, failures: u32, stop: &CancellationToken) -> RecordState {
        let delay = self.policy.backoff_for(failures);
        tokio::select! {
            biased;
            _ = stop.cancelled() => RecordState::Abandoned,
            _ = tokio::time::sleep(delay) => RecordState::Retrying { failures },
        }
    }

    async fn run(self, id: usize) {
        let stop = self.shutdown.workers_token();
        debug!(topic = %self.topic, worker = id, "Worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                item = self.queue.pop() => item,
            };

            match item {
                Some(WorkItem::Record(record)) => {
                    self.process(record, &stop).await;
                }
                Some(WorkItem::Stop) | None => break,
            }
        }

        debug!(topic = %self.topic, worker = id, "Worker stopped");
    }
}

/// Fixed set of worker tasks for one topic
pub struct WorkerPool {
    topic: String,
    queue: WorkQueue,
    shutdown: Arc<ShutdownState>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers on the given runtime
    pub fn spawn(runtime: &Handle, count: usize, context: WorkerContext) -> Self {
        let handles = (0..count)
            .map(|id| runtime.spawn(context.clone().run(id)))
            .collect();

        Self {
            topic: context.topic.clone(),
            queue: context.queue,
            shutdown: context.shutdown,
            handles,
        }
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if the pool has no workers
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for each one, up to `join_timeout` apiece
    ///
    /// Must be called from outside the runtime; the poll loop thread is the
    /// only caller. Join timers are created inside `block_on`.
    pub fn shutdown(self, runtime: &Handle, join_timeout: Duration) {
        self.shutdown.stop_workers();
        for _ in 0..self.handles.len() {
            if !self.queue.try_push_stop() {
                break;
            }
        }

        for (id, handle) in self.handles.into_iter().enumerate() {
            let abort = handle.abort_handle();
            let joined =
                runtime.block_on(async move { tokio::time::timeout(join_timeout, handle).await });
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic = %self.topic, worker = id, error = %e, "Worker task failed"),
                Err(_) => {
                    warn!(
                        topic = %self.topic,
                        worker = id,
                        "Worker did not stop in time, aborting"
                    );
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::dispatcher::RecordHandler;
    use crate::consumer::error::HandlerError;
    use crate::consumer::queue::{ack_channel, AckReceiver};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailTimes {
        remaining: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RecordHandler for FailTimes {
        async fn handle(&self, _record: &Record) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                Err(HandlerError::ProcessingError("not yet".into()))
            } else {
                Ok(())
            }
        }
    }

    fn context(fail_times: u32, policy: RetryPolicy) -> (WorkerContext, Arc<AtomicU32>, AckReceiver) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            "orders",
            FailTimes {
                remaining: AtomicU32::new(fail_times),
                calls: calls.clone(),
            },
        );
        let (acks, ack_rx) = ack_channel();
        let context = WorkerContext {
            topic: "orders".into(),
            queue: WorkQueue::new(10),
            acks,
            dispatcher: Arc::new(dispatcher),
            ledger: Arc::new(RetryLedger::new()),
            policy,
            shutdown: Arc::new(ShutdownState::new()),
            metrics: Arc::new(ConsumerMetrics::new()),
        };
        (context, calls, ack_rx)
    }

    #[tokio::test]
    async fn test_retry_then_ack() {
        let (context, calls, mut acks) = context(2, RetryPolicy::fixed(3, Duration::ZERO));
        let stop = CancellationToken::new();

        let state = context.process(Record::new("orders", 0, 4), &stop).await;

        assert_eq!(state, RecordState::Acked);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(acks.drain().len(), 1);
        assert!(context.ledger.is_empty());
        assert_eq!(context.metrics.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_still_acks() {
        let (context, calls, mut acks) = context(u32::MAX, RetryPolicy::fixed(3, Duration::ZERO));
        let stop = CancellationToken::new();

        let state = context.process(Record::new("orders", 0, 4), &stop).await;

        assert_eq!(state, RecordState::Exhausted { failures: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(acks.drain().len(), 1);
        assert!(context.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_opted_out_topic_single_attempt() {
        let (context, calls, mut acks) = context(u32::MAX, RetryPolicy::no_retry());
        let stop = CancellationToken::new();

        let state = context.process(Record::new("orders", 0, 4), &stop).await;

        assert_eq!(state, RecordState::Acked);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acks.drain().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_abandons() {
        let (context, calls, mut acks) =
            context(u32::MAX, RetryPolicy::fixed(5, Duration::from_secs(60)));
        context.shutdown.add_inflight(1);
        let stop = CancellationToken::new();

        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stop.cancel();
            })
        };

        let state = context.process(Record::new("orders", 0, 4), &stop).await;
        canceller.await.unwrap();

        assert_eq!(state, RecordState::Abandoned);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(acks.drain().is_empty());
        assert!(context.ledger.is_empty());
        assert_eq!(context.shutdown.inflight_count(), 0);
    }

    struct Hang;

    #[async_trait]
    impl RecordHandler for Hang {
        async fn handle(&self, _record: &Record) -> Result<(), HandlerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn multi_thread_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_pool_shutdown_from_plain_thread() {
        let runtime = multi_thread_runtime();
        let (context, _calls, _acks) = context(0, RetryPolicy::no_retry());
        let pool = WorkerPool::spawn(runtime.handle(), 3, context.clone());
        assert_eq!(pool.len(), 3);

        let handle = runtime.handle().clone();
        let joined = std::thread::Builder::new()
            .name("poll-orders".into())
            .spawn(move || pool.shutdown(&handle, Duration::from_secs(1)))
            .unwrap()
            .join();

        assert!(joined.is_ok());
        assert!(context.shutdown.workers_token().is_cancelled());
    }

    #[test]
    fn test_stuck_worker_is_aborted_after_join_timeout() {
        let runtime = multi_thread_runtime();
        let (mut context, _calls, mut acks) = context(0, RetryPolicy::no_retry());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("orders", Hang);
        context.dispatcher = Arc::new(dispatcher);
        context.queue.try_push(Record::new("orders", 0, 1)).unwrap();

        let pool = WorkerPool::spawn(runtime.handle(), 1, context.clone());
        let started = std::time::Instant::now();
        while !context.queue.is_empty() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "worker never took the record"
            );
            std::thread::sleep(Duration::from_millis(1));
        }

        let handle = runtime.handle().clone();
        let started = std::time::Instant::now();
        let joined =
            std::thread::spawn(move || pool.shutdown(&handle, Duration::from_millis(50))).join();

        assert!(joined.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(acks.drain().is_empty());
    }
}
