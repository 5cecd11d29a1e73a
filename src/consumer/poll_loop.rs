//! Per-topic poll loop
//!
//! A [`PollLoop`] runs on its own named OS thread and is the only caller of
//! its broker client. Each iteration it
//!
//! 1. applies backpressure (pause/resume) against work queue occupancy,
//! 2. fetches a batch and appends it to the local backlog,
//! 3. pushes backlog records to the work queue without blocking,
//! 4. drains acknowledgements into the commit cursor and commits when the
//!    batch-or-interval schedule says so.
//!
//! The broker is polled on every iteration, even while the backlog is waiting
//! for queue space, so rebalance callbacks and group liveness never depend on
//! handler speed. A waiting backlog shortens the fetch timeout to
//! `enqueue_backoff` instead; by then the partitions are paused and the fetch
//! mostly services callbacks.
//!
//! Rebalance callbacks run inside the fetch call, on the same thread, and
//! share the topic state through [`TopicCore`]. The commit lock is never held
//! across a fetch, so the callbacks never contend with the loop.

use crate::consumer::backpressure::{FlowControl, FlowDecision};
use crate::consumer::broker::{
    BrokerClient, CommitMode, Fetched, PartitionControl, RebalanceListener,
};
use crate::consumer::config::ConsumerConfig;
use crate::consumer::dispatcher::Dispatcher;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::consumer::offsets::{CommitCursor, CommitSchedule};
use crate::consumer::queue::{ack_channel, AckReceiver, WorkQueue};
use crate::consumer::record::{Record, TopicPartition};
use crate::consumer::retry::{RetryLedger, RetryPolicy};
use crate::consumer::shutdown::{ShutdownState, StopHandle};
use crate::consumer::worker::{WorkerContext, WorkerPool};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

/// Sleep between checks while waiting for in-flight work on shutdown
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one topic's consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TopicState {
    /// Built, not yet subscribed
    Created = 0,
    /// Subscribed, loop thread not yet running
    Subscribed = 1,
    /// Fetching
    Running = 2,
    /// Fetching paused by backpressure
    Paused = 3,
    /// Inside a revoke callback
    Revoking = 4,
    /// Draining and releasing resources
    Stopping = 5,
    /// Broker closed
    Closed = 6,
}

impl TopicState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TopicState::Created,
            1 => TopicState::Subscribed,
            2 => TopicState::Running,
            3 => TopicState::Paused,
            4 => TopicState::Revoking,
            5 => TopicState::Stopping,
            _ => TopicState::Closed,
        }
    }

    /// Check if the loop is fetching or able to fetch
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TopicState::Running | TopicState::Paused | TopicState::Revoking
        )
    }
}

impl fmt::Display for TopicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopicState::Created => "created",
            TopicState::Subscribed => "subscribed",
            TopicState::Running => "running",
            TopicState::Paused => "paused",
            TopicState::Revoking => "revoking",
            TopicState::Stopping => "stopping",
            TopicState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: TopicState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> TopicState {
        TopicState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: TopicState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Partitions currently owned by a topic's consumer
///
/// Never mutated in place; every assign or revoke builds a new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    partitions: BTreeSet<TopicPartition>,
}

impl Assignment {
    /// Copy with `added` merged in
    pub fn merged(&self, added: &[TopicPartition]) -> Self {
        let mut partitions = self.partitions.clone();
        partitions.extend(added.iter().cloned());
        Self { partitions }
    }

    /// Copy with `removed` taken out
    pub fn without(&self, removed: &[TopicPartition]) -> Self {
        let mut partitions = self.partitions.clone();
        for partition in removed {
            partitions.remove(partition);
        }
        Self { partitions }
    }

    /// Check if the partition is owned
    pub fn contains(&self, partition: &TopicPartition) -> bool {
        self.partitions.contains(partition)
    }

    /// Owned partitions, sorted
    pub fn partitions(&self) -> Vec<TopicPartition> {
        self.partitions.iter().cloned().collect()
    }

    /// Number of owned partitions
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Check if nothing is owned
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[derive(Debug)]
struct CommitState {
    acks: AckReceiver,
    cursor: CommitCursor,
    schedule: CommitSchedule,
}

/// Topic state shared between the poll loop and its rebalance callbacks
pub struct TopicCore {
    topic: String,
    assignment: ArcSwap<Assignment>,
    commits: Mutex<CommitState>,
    flow: FlowControl,
    queue: WorkQueue,
    shutdown: Arc<ShutdownState>,
    metrics: Arc<ConsumerMetrics>,
    state: StateCell,
}

impl TopicCore {
    /// Topic name
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state
    pub fn state(&self) -> TopicState {
        self.state.get()
    }

    /// Snapshot of the owned partitions
    pub fn assignment(&self) -> Arc<Assignment> {
        self.assignment.load_full()
    }

    /// Counter values
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Items waiting in the work queue
    pub fn queue_occupancy(&self) -> usize {
        self.queue.occupancy()
    }

    /// Highest acknowledged offset for a partition
    pub fn committed_position(&self, partition: &TopicPartition) -> Option<i64> {
        self.commits.lock().cursor.position(partition)
    }

    fn drain_acks(&self, commits: &mut CommitState) -> usize {
        let acks = commits.acks.drain();
        if acks.is_empty() {
            return 0;
        }

        let drained = acks.len();
        let assignment = self.assignment.load();
        let mut kept = 0;
        for ack in acks {
            if assignment.contains(&ack.partition) {
                commits.cursor.observe(ack);
                kept += 1;
            } else {
                debug!(
                    partition = %ack.partition,
                    offset = ack.offset,
                    "Dropping acknowledgement for unassigned partition"
                );
            }
        }

        commits.schedule.record_acks(kept);
        self.shutdown.remove_inflight(drained);
        drained
    }

    fn commit(&self, control: &dyn PartitionControl, commits: &mut CommitState, mode: CommitMode) {
        let offsets = commits.cursor.commit_offsets();
        let now = Instant::now();
        if offsets.is_empty() {
            commits.schedule.committed(now);
            return;
        }

        match control.commit(&offsets, mode) {
            Ok(()) => {
                self.metrics.increment_commits();
                debug!(
                    topic = %self.topic,
                    partitions = offsets.len(),
                    ?mode,
                    "Committed offsets"
                );
            }
            Err(e) => {
                self.metrics.increment_commit_failures();
                warn!(topic = %self.topic, error = %e, ?mode, "Offset commit failed");
            }
        }
        commits.schedule.committed(now);
    }

    /// Drain acknowledgements and commit asynchronously if the schedule is due
    fn maybe_commit(&self, control: &dyn PartitionControl) {
        let mut commits = self.commits.lock();
        self.drain_acks(&mut commits);
        if commits.schedule.is_due(Instant::now()) {
            self.commit(control, &mut commits, CommitMode::Async);
        }
    }

    /// Drain acknowledgements and commit asynchronously if any arrived
    fn drain_and_commit(&self, control: &dyn PartitionControl) {
        let mut commits = self.commits.lock();
        self.drain_acks(&mut commits);
        if commits.schedule.pending() > 0 {
            self.commit(control, &mut commits, CommitMode::Async);
        }
    }

    /// Drain acknowledgements and commit synchronously
    fn flush(&self, control: &dyn PartitionControl) {
        let mut commits = self.commits.lock();
        self.drain_acks(&mut commits);
        self.commit(control, &mut commits, CommitMode::Sync);
    }

    fn apply_flow(&self, control: &dyn PartitionControl) {
        let decision = self.flow.evaluate(self.queue.occupancy());
        if decision == FlowDecision::Hold {
            return;
        }

        let partitions = self.assignment.load().partitions();
        let result = if partitions.is_empty() {
            Ok(())
        } else if decision == FlowDecision::Pause {
            control.pause(&partitions)
        } else {
            control.resume(&partitions)
        };

        if let Err(e) = result {
            warn!(topic = %self.topic, error = %e, ?decision, "Failed to apply backpressure");
        }

        if decision == FlowDecision::Pause {
            self.metrics.increment_pauses();
            self.state.set(TopicState::Paused);
        } else {
            self.metrics.increment_resumes();
            self.state.set(TopicState::Running);
        }
    }
}

impl RebalanceListener for TopicCore {
    fn on_assign(&self, control: &dyn PartitionControl, partitions: &[TopicPartition]) {
        if partitions.is_empty() {
            return;
        }
        self.metrics.increment_rebalances();
        info!(topic = %self.topic, ?partitions, "Partitions assigned");

        self.assignment
            .store(Arc::new(self.assignment.load().merged(partitions)));

        if let Err(e) = control.incremental_assign(partitions) {
            error!(topic = %self.topic, error = %e, "Incremental assign failed");
        }

        if self.flow.is_paused() || self.shutdown.is_shutting_down() {
            if let Err(e) = control.pause(partitions) {
                warn!(topic = %self.topic, error = %e, "Failed to pause assigned partitions");
            }
        }
    }

    fn on_revoke(&self, control: &dyn PartitionControl, partitions: &[TopicPartition]) {
        if partitions.is_empty() {
            return;
        }
        self.metrics.increment_rebalances();
        info!(topic = %self.topic, ?partitions, "Partitions revoked");

        let previous = self.state.get();
        self.state.set(TopicState::Revoking);

        {
            let mut commits = self.commits.lock();
            self.drain_acks(&mut commits);
            self.commit(control, &mut commits, CommitMode::Sync);

            if let Err(e) = control.incremental_unassign(partitions) {
                error!(topic = %self.topic, error = %e, "Incremental unassign failed");
            }

            self.assignment
                .store(Arc::new(self.assignment.load().without(partitions)));
            commits.cursor.remove(partitions);
        }

        self.state.set(previous);
    }
}

/// Loop timings taken from [`ConsumerConfig`]
#[derive(Debug, Clone)]
struct LoopSettings {
    batch_size: usize,
    poll_timeout: Duration,
    drain_timeout: Duration,
    worker_join_timeout: Duration,
    enqueue_backoff: Duration,
}

impl From<&ConsumerConfig> for LoopSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            batch_size: config.poll_batch_size,
            poll_timeout: config.effective_poll_timeout(),
            drain_timeout: config.shutdown_drain_timeout,
            worker_join_timeout: config.worker_join_timeout,
            enqueue_backoff: config.enqueue_backoff,
        }
    }
}

/// The broker-facing loop for one topic
pub struct PollLoop<B: BrokerClient> {
    broker: B,
    core: Arc<TopicCore>,
    settings: LoopSettings,
    runtime: Handle,
    workers: Option<WorkerPool>,
    backlog: VecDeque<Record>,
}

impl<B: BrokerClient> PollLoop<B> {
    /// Subscribe, start the worker pool and run the loop on a new thread
    ///
    /// Workers are spawned on `runtime`; the loop itself never runs inside
    /// the runtime.
    pub fn spawn(
        mut broker: B,
        topic: &str,
        group_id: &str,
        config: &ConsumerConfig,
        dispatcher: Arc<Dispatcher>,
        runtime: Handle,
    ) -> ConsumerResult<TopicHandle> {
        let queue = WorkQueue::new(config.work_queue_capacity);
        let (acks, ack_rx) = ack_channel();
        let shutdown = Arc::new(ShutdownState::new());
        let metrics = Arc::new(ConsumerMetrics::new());

        let core = Arc::new(TopicCore {
            topic: topic.to_string(),
            assignment: ArcSwap::from_pointee(Assignment::default()),
            commits: Mutex::new(CommitState {
                acks: ack_rx,
                cursor: CommitCursor::new(),
                schedule: CommitSchedule::new(config.commit_batch_size, config.commit_interval),
            }),
            flow: FlowControl::new(
                config.work_queue_capacity,
                config.pause_fraction,
                config.resume_fraction,
            ),
            queue: queue.clone(),
            shutdown: shutdown.clone(),
            metrics: metrics.clone(),
            state: StateCell::new(TopicState::Created),
        });

        let listener: Arc<dyn RebalanceListener> = core.clone();
        broker.subscribe(&[topic.to_string()], listener)?;
        core.state.set(TopicState::Subscribed);
        info!(topic, group_id, "Subscribed");

        let policy: RetryPolicy = config.retry.for_topic(topic).clone();
        let workers = WorkerPool::spawn(
            &runtime,
            config.worker_count,
            WorkerContext {
                topic: topic.to_string(),
                queue,
                acks,
                dispatcher,
                ledger: Arc::new(RetryLedger::new()),
                policy,
                shutdown: shutdown.clone(),
                metrics,
            },
        );

        let stop = StopHandle::new(shutdown.clone(), broker.waker());
        let poll_loop = PollLoop {
            broker,
            core: core.clone(),
            settings: LoopSettings::from(config),
            runtime,
            workers: Some(workers),
            backlog: VecDeque::new(),
        };

        let thread = std::thread::Builder::new()
            .name(format!("poll-{}", topic))
            .spawn(move || poll_loop.run())
            .map_err(|e| {
                shutdown.stop_workers();
                ConsumerError::IoError(e)
            })?;

        Ok(TopicHandle {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            core,
            stop,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> ConsumerResult<()> {
        let topic = self.core.topic.clone();
        self.core.state.set(TopicState::Running);
        info!(topic = %topic, "Poll loop started");

        let result = self.poll_until_stopped();
        if let Err(e) = &result {
            error!(topic = %topic, error = %e, "Poll loop aborted");
        }

        self.shutdown();
        info!(topic = %topic, "Poll loop stopped");
        result
    }

    fn poll_until_stopped(&mut self) -> ConsumerResult<()> {
        while !self.core.shutdown.stop_requested() {
            self.core.apply_flow(&self.broker);

            let timeout = if self.backlog.is_empty() {
                self.settings.poll_timeout
            } else {
                self.settings.enqueue_backoff
            };
            self.fetch(timeout)?;
            self.enqueue_backlog();

            self.core.maybe_commit(&self.broker);
        }
        Ok(())
    }

    fn fetch(&mut self, timeout: Duration) -> ConsumerResult<()> {
        let fetched = self.broker.consume(self.settings.batch_size, timeout);
        let assignment = self.core.assignment.load();

        for item in fetched {
            match item {
                Fetched::Record(record) => {
                    self.core.metrics.increment_fetched();
                    if assignment.contains(&record.topic_partition()) {
                        self.backlog.push_back(record);
                    } else {
                        debug!(
                            record = %record.key_id(),
                            "Skipping record from unassigned partition"
                        );
                    }
                }
                Fetched::PartitionEof(partition) => {
                    trace!(partition = %partition, "Reached end of partition");
                }
                Fetched::Error(e) if e.is_fatal() => return Err(e.into()),
                Fetched::Error(e) => {
                    warn!(topic = %self.core.topic, error = %e, "Broker error, skipping");
                }
            }
        }
        Ok(())
    }

    /// Push backlog records until the queue is full
    ///
    /// Records whose partition was revoked while they waited are dropped.
    fn enqueue_backlog(&mut self) {
        let assignment = self.core.assignment.load();
        while let Some(record) = self.backlog.pop_front() {
            if !assignment.contains(&record.topic_partition()) {
                debug!(
                    record = %record.key_id(),
                    "Dropping held record from revoked partition"
                );
                continue;
            }
            self.core.shutdown.add_inflight(1);
            match self.core.queue.try_push(record) {
                Ok(()) => self.core.metrics.increment_enqueued(),
                Err(record) => {
                    self.core.shutdown.remove_inflight(1);
                    self.core.metrics.increment_queue_full();
                    trace!(record = %record.key_id(), "Work queue full, deferring");
                    self.backlog.push_front(record);
                    return;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let core = self.core.clone();
        core.state.set(TopicState::Stopping);
        core.shutdown.begin_shutdown();

        let assigned = core.assignment.load().partitions();
        if !assigned.is_empty() {
            if let Err(e) = self.broker.pause(&assigned) {
                warn!(topic = %core.topic, error = %e, "Failed to pause partitions on stop");
            }
        }
        if !self.backlog.is_empty() {
            debug!(
                topic = %core.topic,
                records = self.backlog.len(),
                "Discarding records never handed to workers"
            );
            self.backlog.clear();
        }

        let deadline = Instant::now() + self.settings.drain_timeout;
        while core.shutdown.has_inflight() && Instant::now() < deadline {
            core.drain_and_commit(&self.broker);
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
        if core.shutdown.has_inflight() {
            warn!(
                topic = %core.topic,
                inflight = core.shutdown.inflight_count(),
                "Shutdown drain timed out"
            );
        }

        core.flush(&self.broker);

        if let Some(workers) = self.workers.take() {
            workers.shutdown(&self.runtime, self.settings.worker_join_timeout);
        }

        self.broker.close();
        core.state.set(TopicState::Closed);
        core.shutdown.complete_shutdown();
    }
}

/// Owner-side handle to a running poll loop
pub struct TopicHandle {
    topic: String,
    group_id: String,
    core: Arc<TopicCore>,
    stop: StopHandle,
    thread: Option<JoinHandle<ConsumerResult<()>>>,
}

impl TopicHandle {
    /// Topic name
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TopicState {
        self.core.state()
    }

    /// Shared topic state
    pub fn core(&self) -> &Arc<TopicCore> {
        &self.core
    }

    /// Counter values
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics()
    }

    /// Ask the loop to stop without waiting
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Check if the loop thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Block until the loop thread exits or `timeout` passes
    ///
    /// Returns the loop's own result, which carries a fatal broker error if
    /// one aborted it.
    pub fn join(mut self, timeout: Duration) -> ConsumerResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                return Err(ConsumerError::ShutdownError(format!(
                    "poll loop for {} did not stop within {:?}",
                    self.topic, timeout
                )));
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }

        thread.join().map_err(|_| {
            ConsumerError::ShutdownError(format!("poll loop for {} panicked", self.topic))
        })?
    }
}

impl fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicHandle")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("state", &self.state())
            .finish()
    }
}
