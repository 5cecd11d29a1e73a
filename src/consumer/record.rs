//! Records, partition identities and acknowledgement signals

use std::fmt;

/// A `(topic, partition)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic partition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Identity of a single record, used for failure counting
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Partition-local offset
    pub offset: i64,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// One fetched broker message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Partition-local offset
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Message payload (if present)
    pub value: Option<Vec<u8>>,
    /// Message headers in broker order
    pub headers: Vec<(String, Option<Vec<u8>>)>,
    /// Broker timestamp in milliseconds (if available)
    pub timestamp: Option<i64>,
}

impl Record {
    /// Create a record with no key, payload or headers
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    /// Set the payload
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header
    pub fn with_header(mut self, name: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value));
        self
    }

    /// Failure-counting identity of this record
    pub fn key_id(&self) -> RecordKey {
        RecordKey {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// Partition this record was fetched from
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Acknowledgement for this record
    pub fn ack(&self) -> AckSignal {
        AckSignal {
            partition: self.topic_partition(),
            offset: self.offset,
        }
    }

    /// Look up the first header with the given name
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Notice that a record at `offset` has been handled (succeeded or exhausted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckSignal {
    /// Partition the record belongs to
    pub partition: TopicPartition,
    /// Offset of the handled record
    pub offset: i64,
}

/// Offset to commit for a partition: the next offset to read on restart
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitOffset {
    /// Partition being committed
    pub partition: TopicPartition,
    /// Next offset to consume
    pub offset: i64,
}
