//! Scripted in-memory broker for driving poll loops in tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use topic_worker::consumer::{
    BrokerClient, BrokerError, BrokerFactory, CommitMode, CommitOffset, ConsumerConfig, Fetched,
    PartitionControl, RebalanceListener, Record, TopicPartition, Wakeup,
};

/// Calls the runtime made against the broker, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Subscribe(String),
    Assign(Vec<i32>),
    Unassign(Vec<i32>),
    Pause(Vec<i32>),
    Resume(Vec<i32>),
    Commit(Vec<(i32, i64)>, CommitMode),
    Close,
}

enum Rebalance {
    Assign(Vec<i32>),
    Revoke(Vec<i32>),
}

enum Event {
    Record(Record),
    Eof(i32),
    Error(BrokerError),
}

/// Rebalances are delivered at the start of the next `consume`, ahead of
/// any queued events
#[derive(Default)]
struct State {
    rebalances: VecDeque<Rebalance>,
    events: VecDeque<Event>,
    calls: Vec<Call>,
    paused: BTreeSet<i32>,
    groups: Vec<String>,
    listener: Option<Arc<dyn RebalanceListener>>,
}

/// Test-side view of one topic's broker
#[derive(Clone)]
pub struct BrokerScript {
    topic: String,
    state: Arc<Mutex<State>>,
}

impl BrokerScript {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn assign(&self, partitions: &[i32]) -> &Self {
        self.rebalance(Rebalance::Assign(partitions.to_vec()))
    }

    pub fn revoke(&self, partitions: &[i32]) -> &Self {
        self.rebalance(Rebalance::Revoke(partitions.to_vec()))
    }

    fn rebalance(&self, rebalance: Rebalance) -> &Self {
        self.state.lock().rebalances.push_back(rebalance);
        self
    }

    pub fn records(&self, partition: i32, offsets: std::ops::Range<i64>) -> &Self {
        for offset in offsets {
            let record = Record::new(self.topic.clone(), partition, offset)
                .with_value(format!("payload-{}", offset).into_bytes());
            self.push(Event::Record(record));
        }
        self
    }

    pub fn eof(&self, partition: i32) -> &Self {
        self.push(Event::Eof(partition))
    }

    pub fn error(&self, error: BrokerError) -> &Self {
        self.push(Event::Error(error))
    }

    fn push(&self, event: Event) -> &Self {
        self.state.lock().events.push_back(event);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn groups(&self) -> Vec<String> {
        self.state.lock().groups.clone()
    }

    /// Every commit, in order
    pub fn commits(&self) -> Vec<(Vec<(i32, i64)>, CommitMode)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Commit(offsets, mode) => Some((offsets, mode)),
                _ => None,
            })
            .collect()
    }

    /// Last committed offset for a partition
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.commits()
            .iter()
            .flat_map(|(offsets, _)| offsets.iter())
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
            .last()
    }

    pub fn position_of(&self, wanted: &Call) -> Option<usize> {
        self.calls().iter().position(|call| call == wanted)
    }
}

fn ids(partitions: &[TopicPartition]) -> Vec<i32> {
    partitions.iter().map(|p| p.partition).collect()
}

struct WakeFlag(AtomicBool);

impl Wakeup for WakeFlag {
    fn wakeup(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Broker client replaying a [`BrokerScript`]
pub struct MockBroker {
    script: BrokerScript,
    wake: Arc<WakeFlag>,
}

impl MockBroker {
    fn tps(&self, partitions: &[i32]) -> Vec<TopicPartition> {
        partitions
            .iter()
            .map(|p| TopicPartition::new(self.script.topic.clone(), *p))
            .collect()
    }

    fn record(&self, call: Call) {
        self.script.state.lock().calls.push(call);
    }
}

impl PartitionControl for MockBroker {
    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let mut state = self.script.state.lock();
        state.paused.extend(ids(partitions));
        state.calls.push(Call::Pause(ids(partitions)));
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let mut state = self.script.state.lock();
        for partition in ids(partitions) {
            state.paused.remove(&partition);
        }
        state.calls.push(Call::Resume(ids(partitions)));
        Ok(())
    }

    fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.record(Call::Assign(ids(partitions)));
        Ok(())
    }

    fn incremental_unassign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.record(Call::Unassign(ids(partitions)));
        Ok(())
    }

    fn commit(&self, offsets: &[CommitOffset], mode: CommitMode) -> Result<(), BrokerError> {
        let offsets = offsets
            .iter()
            .map(|o| (o.partition.partition, o.offset))
            .collect();
        self.record(Call::Commit(offsets, mode));
        Ok(())
    }
}

impl BrokerClient for MockBroker {
    fn subscribe(
        &mut self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        let mut state = self.script.state.lock();
        state.calls.push(Call::Subscribe(topics.join(",")));
        state.listener = Some(listener);
        Ok(())
    }

    fn consume(&mut self, max: usize, timeout: Duration) -> Vec<Fetched> {
        loop {
            let mut state = self.script.state.lock();
            let Some(rebalance) = state.rebalances.pop_front() else {
                break;
            };
            let listener = state.listener.clone();
            drop(state);

            if let Some(listener) = listener {
                match rebalance {
                    Rebalance::Assign(partitions) => {
                        listener.on_assign(&*self, &self.tps(&partitions))
                    }
                    Rebalance::Revoke(partitions) => {
                        listener.on_revoke(&*self, &self.tps(&partitions))
                    }
                }
            }
        }

        let mut fetched = Vec::new();
        {
            let mut state = self.script.state.lock();
            while fetched.len() < max {
                let State { events, paused, .. } = &mut *state;
                // Records of paused partitions stay queued without blocking others
                let next = events.iter().position(|event| match event {
                    Event::Record(record) => !paused.contains(&record.partition),
                    Event::Eof(_) | Event::Error(_) => true,
                });
                let Some(event) = next.and_then(|index| events.remove(index)) else {
                    break;
                };

                fetched.push(match event {
                    Event::Record(record) => Fetched::Record(record),
                    Event::Eof(partition) => Fetched::PartitionEof(TopicPartition::new(
                        self.script.topic.clone(),
                        partition,
                    )),
                    Event::Error(error) => Fetched::Error(error),
                });
            }
        }

        if fetched.is_empty() && !self.wake.0.swap(false, Ordering::AcqRel) {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        fetched
    }

    fn waker(&self) -> Arc<dyn Wakeup> {
        self.wake.clone()
    }

    fn close(&mut self) {
        self.record(Call::Close);
    }
}

/// Hands out brokers backed by per-topic scripts
#[derive(Clone, Default)]
pub struct MockFactory {
    scripts: Arc<Mutex<HashMap<String, BrokerScript>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for `topic`, shared with every broker created for it
    pub fn script(&self, topic: &str) -> BrokerScript {
        self.scripts
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| BrokerScript::new(topic))
            .clone()
    }
}

impl BrokerFactory for MockFactory {
    type Broker = MockBroker;

    fn create(&self, topic: &str, group_id: &str) -> Result<MockBroker, BrokerError> {
        let script = self.script(topic);
        script.state.lock().groups.push(group_id.to_string());
        Ok(MockBroker {
            script,
            wake: Arc::new(WakeFlag(AtomicBool::new(false))),
        })
    }
}

/// Small, fast configuration for tests
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .group_id_prefix("tests")
        .poll_batch_size(50)
        .poll_timeout(Duration::from_millis(10))
        .worker_count(4)
        .work_queue_capacity(100)
        .commit_batch_size(10)
        .commit_interval(Duration::from_millis(20))
        .shutdown_drain_timeout(Duration::from_secs(5))
        .worker_join_timeout(Duration::from_millis(500))
        .build()
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` with an upper bound on wall time
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .unwrap_or_else(|_| panic!("operation did not finish within {:?}", timeout))
}
