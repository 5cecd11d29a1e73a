//! Broker client abstraction
//!
//! The runtime never talks to a broker library directly. A [`BrokerClient`]
//! is owned by exactly one poll loop thread, which makes every state-mutating
//! call (consume, pause, resume, assign, unassign, commit) single-writer by
//! construction. Rebalance callbacks are delivered from inside
//! [`BrokerClient::consume`], on that same thread, through a
//! [`RebalanceListener`] registered at subscribe time.

use crate::consumer::error::BrokerError;
use crate::consumer::record::{CommitOffset, Record, TopicPartition};
use std::sync::Arc;
use std::time::Duration;

/// Commit mode for offset commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until the broker acknowledges the commit
    Sync,
    /// Fire and forget; the result is only logged
    Async,
}

/// One item returned by a fetch
#[derive(Debug)]
pub enum Fetched {
    /// A record ready for processing
    Record(Record),
    /// End-of-partition marker
    PartitionEof(TopicPartition),
    /// Per-record or per-call error
    Error(BrokerError),
}

/// Partition and offset control available both to the poll loop and to
/// rebalance callbacks
pub trait PartitionControl {
    /// Stop fetching from the given partitions
    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Resume fetching from the given partitions
    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Add partitions to the current assignment
    fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Remove partitions from the current assignment
    fn incremental_unassign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Commit the given offsets
    fn commit(&self, offsets: &[CommitOffset], mode: CommitMode) -> Result<(), BrokerError>;
}

/// Receives cooperative rebalance events
///
/// Both methods run synchronously inside [`BrokerClient::consume`] and must
/// have finished their work before returning, since the broker resumes its
/// rebalance protocol right after.
pub trait RebalanceListener: Send + Sync {
    /// Partitions were added to this consumer
    fn on_assign(&self, control: &dyn PartitionControl, partitions: &[TopicPartition]);

    /// Partitions are being taken away from this consumer
    fn on_revoke(&self, control: &dyn PartitionControl, partitions: &[TopicPartition]);
}

/// Unblocks a thread parked in [`BrokerClient::consume`]
pub trait Wakeup: Send + Sync {
    /// Wake the consumer; safe to call from any thread
    fn wakeup(&self);
}

/// A broker client owned by a single poll loop
pub trait BrokerClient: PartitionControl + Send + 'static {
    /// Subscribe to topics; rebalance events go to `listener`
    fn subscribe(
        &mut self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError>;

    /// Fetch up to `max` items, waiting at most `timeout`
    fn consume(&mut self, max: usize, timeout: Duration) -> Vec<Fetched>;

    /// Handle that can interrupt a blocked `consume` from another thread
    fn waker(&self) -> Arc<dyn Wakeup>;

    /// Leave the group and release the client
    fn close(&mut self);
}

/// Builds one broker client per topic
pub trait BrokerFactory: Send + Sync + 'static {
    /// Client type produced by this factory
    type Broker: BrokerClient;

    /// Create a client for `topic` joining consumer group `group_id`
    fn create(&self, topic: &str, group_id: &str) -> Result<Self::Broker, BrokerError>;
}
