//! Commit cursor and commit scheduling

use crate::consumer::record::{AckSignal, CommitOffset, TopicPartition};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Highest acknowledged offset per partition
///
/// The cursor is highest-seen, not gap-aware: acknowledging offset 5 before
/// offset 3 moves the partition straight to 5. Workers only acknowledge a
/// record once it is resolved, so any lower offset still in flight will be
/// redelivered at worst.
#[derive(Debug, Default, Clone)]
pub struct CommitCursor {
    positions: BTreeMap<TopicPartition, i64>,
}

impl CommitCursor {
    /// Create an empty cursor
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an acknowledgement into the cursor
    ///
    /// Returns true when the partition's position moved forward.
    pub fn observe(&mut self, ack: AckSignal) -> bool {
        match self.positions.get_mut(&ack.partition) {
            Some(position) if *position >= ack.offset => false,
            Some(position) => {
                *position = ack.offset;
                true
            }
            None => {
                trace!(partition = %ack.partition, offset = ack.offset, "Tracking new partition");
                self.positions.insert(ack.partition, ack.offset);
                true
            }
        }
    }

    /// Highest acknowledged offset for a partition
    pub fn position(&self, partition: &TopicPartition) -> Option<i64> {
        self.positions.get(partition).copied()
    }

    /// Commit request covering every tracked partition
    ///
    /// Each entry is the next offset to read on restart.
    pub fn commit_offsets(&self) -> Vec<CommitOffset> {
        self.positions
            .iter()
            .map(|(partition, offset)| CommitOffset {
                partition: partition.clone(),
                offset: offset + 1,
            })
            .collect()
    }

    /// Stop tracking the given partitions
    pub fn remove(&mut self, partitions: &[TopicPartition]) {
        for partition in partitions {
            self.positions.remove(partition);
        }
    }

    /// Number of tracked partitions
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check if no partition is tracked
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Batch-or-interval commit trigger
#[derive(Debug)]
pub struct CommitSchedule {
    batch_size: usize,
    interval: Duration,
    acks_since_commit: usize,
    last_commit: Instant,
}

impl CommitSchedule {
    /// Create a schedule; the interval clock starts now
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size,
            interval,
            acks_since_commit: 0,
            last_commit: Instant::now(),
        }
    }

    /// Count drained acknowledgements
    pub fn record_acks(&mut self, count: usize) {
        self.acks_since_commit += count;
    }

    /// Acknowledgements drained since the last commit
    pub fn pending(&self) -> usize {
        self.acks_since_commit
    }

    /// Check if an asynchronous commit is due
    ///
    /// Nothing is due until at least one acknowledgement arrived since the
    /// last commit.
    pub fn is_due(&self, now: Instant) -> bool {
        self.acks_since_commit > 0
            && (self.acks_since_commit >= self.batch_size
                || now.duration_since(self.last_commit) >= self.interval)
    }

    /// Reset counters after a commit was issued
    pub fn committed(&mut self, now: Instant) {
        self.acks_since_commit = 0;
        self.last_commit = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ack(partition: i32, offset: i64) -> AckSignal {
        AckSignal {
            partition: TopicPartition::new("orders", partition),
            offset,
        }
    }

    #[test]
    fn test_highest_seen_cursor() {
        let mut cursor = CommitCursor::new();

        assert!(cursor.observe(ack(0, 5)));
        assert!(!cursor.observe(ack(0, 3)));
        assert!(cursor.observe(ack(1, 0)));

        assert_eq!(
            cursor.commit_offsets(),
            vec![
                CommitOffset {
                    partition: TopicPartition::new("orders", 0),
                    offset: 6,
                },
                CommitOffset {
                    partition: TopicPartition::new("orders", 1),
                    offset: 1,
                },
            ]
        );
    }

    #[test]
    fn test_remove_partitions() {
        let mut cursor = CommitCursor::new();
        cursor.observe(ack(0, 10));
        cursor.observe(ack(1, 20));

        cursor.remove(&[TopicPartition::new("orders", 0)]);

        assert_eq!(cursor.len(), 1);
        assert_eq!(cursor.position(&TopicPartition::new("orders", 0)), None);
        assert_eq!(cursor.position(&TopicPartition::new("orders", 1)), Some(20));
    }

    #[test]
    fn test_schedule_batch_trigger() {
        let mut schedule = CommitSchedule::new(3, Duration::from_secs(3600));
        let now = Instant::now();

        assert!(!schedule.is_due(now));
        schedule.record_acks(2);
        assert!(!schedule.is_due(now));
        schedule.record_acks(1);
        assert!(schedule.is_due(now));

        schedule.committed(now);
        assert_eq!(schedule.pending(), 0);
        assert!(!schedule.is_due(now));
    }

    #[test]
    fn test_schedule_interval_trigger() {
        let mut schedule = CommitSchedule::new(1000, Duration::from_millis(500));
        let start = Instant::now();

        schedule.record_acks(1);
        assert!(schedule.is_due(start + Duration::from_millis(600)));

        // an elapsed interval alone does not commit
        schedule.committed(start);
        assert!(!schedule.is_due(start + Duration::from_secs(10)));
    }

    proptest! {
        #[test]
        fn commit_offsets_never_decrease(acks in prop::collection::vec((0i32..4, 0i64..1000), 1..300)) {
            let mut cursor = CommitCursor::new();
            let mut committed: BTreeMap<TopicPartition, i64> = BTreeMap::new();

            for (partition, offset) in acks {
                cursor.observe(ack(partition, offset));
                for commit in cursor.commit_offsets() {
                    if let Some(previous) = committed.get(&commit.partition) {
                        prop_assert!(commit.offset >= *previous);
                    }
                    committed.insert(commit.partition, commit.offset);
                }
            }
        }
    }
}
