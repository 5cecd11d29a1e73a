//! Bounded work queue and acknowledgement channel
//!
//! Both are plain tokio channels. The work queue is shared by all workers of
//! a topic, so its receiver sits behind an async mutex; the poll loop pushes
//! with `try_send` from its own thread and never blocks on a full queue.

use crate::consumer::record::{AckSignal, Record};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// An entry in the work queue
#[derive(Debug)]
pub enum WorkItem {
    /// A record to process
    Record(Record),
    /// Sentinel telling one worker to exit
    Stop,
}

/// Fixed-capacity multi-producer, multi-consumer queue of records
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Push without waiting; hands the record back when the queue is full
    pub fn try_push(&self, record: Record) -> Result<(), Record> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(WorkItem::Record(record));
                Ok(())
            }
            Err(_) => Err(record),
        }
    }

    /// Push a stop sentinel without waiting
    pub fn try_push_stop(&self) -> bool {
        self.tx.try_send(WorkItem::Stop).is_ok()
    }

    /// Wait for the next item
    pub async fn pop(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    /// Items currently queued
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }
}

/// Create the acknowledgement channel for one topic
pub fn ack_channel() -> (AckSender, AckReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AckSender { tx }, AckReceiver { rx })
}

/// Producer half of the acknowledgement channel, cloned into every worker
#[derive(Debug, Clone)]
pub struct AckSender {
    tx: mpsc::UnboundedSender<AckSignal>,
}

impl AckSender {
    /// Report a resolved record; false once the poll loop is gone
    pub fn send(&self, ack: AckSignal) -> bool {
        self.tx.send(ack).is_ok()
    }
}

/// Consumer half of the acknowledgement channel, owned by the poll loop
#[derive(Debug)]
pub struct AckReceiver {
    rx: mpsc::UnboundedReceiver<AckSignal>,
}

impl AckReceiver {
    /// Take every acknowledgement currently in the channel
    pub fn drain(&mut self) -> Vec<AckSignal> {
        let mut acks = Vec::new();
        while let Ok(ack) = self.rx.try_recv() {
            acks.push(ack);
        }
        acks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_bounded() {
        let queue = WorkQueue::new(2);

        assert!(queue.try_push(Record::new("orders", 0, 1)).is_ok());
        assert!(queue.try_push(Record::new("orders", 0, 2)).is_ok());
        let rejected = queue.try_push(Record::new("orders", 0, 3)).unwrap_err();

        assert_eq!(rejected.offset, 3);
        assert_eq!(queue.occupancy(), 2);
        assert_eq!(queue.capacity(), 2);
        assert!(!queue.try_push_stop());
    }

    #[tokio::test]
    async fn test_pop_in_fifo_order() {
        let queue = WorkQueue::new(4);
        queue.try_push(Record::new("orders", 0, 1)).unwrap();
        queue.try_push(Record::new("orders", 0, 2)).unwrap();
        assert!(queue.try_push_stop());

        let mut offsets = Vec::new();
        while let Some(WorkItem::Record(record)) = queue.pop().await {
            offsets.push(record.offset);
        }

        assert_eq!(offsets, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shared_consumers() {
        let queue = WorkQueue::new(100);
        for offset in 0..50 {
            queue.try_push(Record::new("orders", 0, offset)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            assert!(queue.try_push_stop());
            handles.push(tokio::spawn(async move {
                let mut seen = 0;
                while let Some(WorkItem::Record(_)) = queue.pop().await {
                    seen += 1;
                }
                seen
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);
    }

    #[test]
    fn test_ack_drain() {
        let (tx, mut rx) = ack_channel();
        let record = Record::new("orders", 1, 9);

        assert!(tx.send(record.ack()));
        assert!(tx.clone().send(record.ack()));

        assert_eq!(rx.drain().len(), 2);
        assert!(rx.drain().is_empty());
    }
}
