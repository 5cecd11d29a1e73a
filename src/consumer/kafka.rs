//! Kafka broker client backed by rdkafka
//!
//! The client is a [`BaseConsumer`] polled from the poll loop thread. The
//! consumer context overrides the rebalance callback so that cooperative
//! assign and revoke events reach the topic's [`RebalanceListener`], which
//! performs the incremental assign/unassign itself.

use crate::consumer::broker::{
    BrokerClient, BrokerFactory, CommitMode, Fetched, PartitionControl, RebalanceListener, Wakeup,
};
use crate::consumer::config::ConsumerConfig;
use crate::consumer::error::BrokerError;
use crate::consumer::record::{CommitOffset, Record, TopicPartition};
use parking_lot::RwLock;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single poll; a wakeup is noticed within this time
const WAKE_SLICE: Duration = Duration::from_millis(100);

/// Consumer context routing rebalances to the topic's listener
pub struct KafkaContext {
    topic: String,
    listener: RwLock<Option<Arc<dyn RebalanceListener>>>,
}

impl KafkaContext {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            listener: RwLock::new(None),
        }
    }
}

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        let partitions = from_tpl(tpl);
        let control = ConsumerControl(base_consumer);
        let listener = self.listener.read().clone();

        match (err, listener) {
            (RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS, Some(listener)) => {
                listener.on_assign(&control, &partitions);
            }
            (RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS, Some(listener)) => {
                listener.on_revoke(&control, &partitions);
            }
            (RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS, None) => {
                warn!(topic = %self.topic, "Assignment before subscribe, assigning without listener");
                if let Err(e) = control.incremental_assign(&partitions) {
                    error!(topic = %self.topic, error = %e, "Incremental assign failed");
                }
            }
            (RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS, None) => {
                if let Err(e) = control.incremental_unassign(&partitions) {
                    error!(topic = %self.topic, error = %e, "Incremental unassign failed");
                }
            }
            (err, _) => {
                error!(topic = %self.topic, ?err, "Rebalance error, dropping assignment");
                if let Err(e) = base_consumer.unassign() {
                    error!(topic = %self.topic, error = %e, "Unassign failed");
                }
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(topic = %self.topic, partitions = offsets.count(), "Offsets committed"),
            Err(e) => warn!(topic = %self.topic, error = %e, "Offset commit failed"),
        }
    }
}

/// Partition control over a borrowed consumer, usable inside callbacks
struct ConsumerControl<'a>(&'a BaseConsumer<KafkaContext>);

impl PartitionControl for ConsumerControl<'_> {
    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        Ok(self.0.pause(&to_tpl(partitions))?)
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        Ok(self.0.resume(&to_tpl(partitions))?)
    }

    fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        Ok(self.0.incremental_assign(&to_tpl(partitions))?)
    }

    fn incremental_unassign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        Ok(self.0.incremental_unassign(&to_tpl(partitions))?)
    }

    fn commit(&self, offsets: &[CommitOffset], mode: CommitMode) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        for commit in offsets {
            tpl.add_partition_offset(
                &commit.partition.topic,
                commit.partition.partition,
                Offset::Offset(commit.offset),
            )?;
        }
        let mode = match mode {
            CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
            CommitMode::Async => rdkafka::consumer::CommitMode::Async,
        };
        self.0
            .commit(&tpl, mode)
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct WakeFlag(AtomicBool);

impl Wakeup for WakeFlag {
    fn wakeup(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A Kafka consumer for a single topic
pub struct KafkaBroker {
    topic: String,
    consumer: Option<BaseConsumer<KafkaContext>>,
    wake: Arc<WakeFlag>,
}

impl KafkaBroker {
    fn consumer(&self) -> Result<&BaseConsumer<KafkaContext>, BrokerError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Fatal(format!("consumer for {} is closed", self.topic)))
    }

    fn control(&self) -> Result<ConsumerControl<'_>, BrokerError> {
        self.consumer().map(ConsumerControl)
    }

    fn classify(consumer: &BaseConsumer<KafkaContext>, err: KafkaError) -> BrokerError {
        match consumer.client().fatal_error() {
            Some((code, reason)) => BrokerError::Fatal(format!("{:?}: {}", code, reason)),
            None => err.into(),
        }
    }
}

impl PartitionControl for KafkaBroker {
    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.control()?.pause(partitions)
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.control()?.resume(partitions)
    }

    fn incremental_assign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.control()?.incremental_assign(partitions)
    }

    fn incremental_unassign(&self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.control()?.incremental_unassign(partitions)
    }

    fn commit(&self, offsets: &[CommitOffset], mode: CommitMode) -> Result<(), BrokerError> {
        self.control()?.commit(offsets, mode)
    }
}

impl BrokerClient for KafkaBroker {
    fn subscribe(
        &mut self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;
        *consumer.context().listener.write() = Some(listener);

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    fn consume(&mut self, max: usize, timeout: Duration) -> Vec<Fetched> {
        let Some(consumer) = self.consumer.as_ref() else {
            return vec![Fetched::Error(BrokerError::Fatal(format!(
                "consumer for {} is closed",
                self.topic
            )))];
        };

        let deadline = Instant::now() + timeout;
        let mut fetched = Vec::new();

        // Polls at least once, even with a zero timeout
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match consumer.poll(remaining.min(WAKE_SLICE)) {
                None => {}
                Some(Ok(message)) => fetched.push(Fetched::Record(to_record(&message))),
                Some(Err(KafkaError::PartitionEOF(partition))) => {
                    fetched.push(Fetched::PartitionEof(TopicPartition::new(
                        self.topic.clone(),
                        partition,
                    )));
                }
                Some(Err(e)) => {
                    let error = Self::classify(consumer, e);
                    let fatal = error.is_fatal();
                    fetched.push(Fetched::Error(error));
                    if fatal {
                        break;
                    }
                }
            }

            if fetched.len() >= max
                || self.wake.0.swap(false, Ordering::AcqRel)
                || Instant::now() >= deadline
            {
                break;
            }
        }

        fetched
    }

    fn waker(&self) -> Arc<dyn Wakeup> {
        self.wake.clone()
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            drop(consumer);
            info!(topic = %self.topic, "Consumer closed");
        }
    }
}

/// Builds a [`KafkaBroker`] per topic from the shared configuration
pub struct KafkaBrokerFactory {
    config: Arc<ConsumerConfig>,
}

impl KafkaBrokerFactory {
    /// Create a factory for the given configuration
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Client properties for one consumer
    pub fn client_config(&self, group_id: &str) -> ClientConfig {
        let config = &self.config;
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("isolation.level", &config.isolation_level)
            .set(
                "allow.auto.create.topics",
                config.allow_auto_create_topics.to_string(),
            )
            .set("fetch.min.bytes", config.fetch.fetch_min_bytes.to_string())
            .set("fetch.wait.max.ms", config.fetch.fetch_wait_max_ms.to_string())
            .set(
                "queued.max.messages.kbytes",
                config.fetch.queued_max_messages_kbytes.to_string(),
            )
            .set(
                "queued.min.messages",
                config.fetch.queued_min_messages.to_string(),
            )
            .set(
                "statistics.interval.ms",
                config.fetch.statistics_interval_ms.to_string(),
            )
            .set_log_level(RDKafkaLogLevel::Warning);

        if let Some(security) = &config.security {
            client_config
                .set("security.protocol", &security.protocol)
                .set("sasl.mechanisms", &security.sasl_mechanism)
                .set("sasl.username", &security.username)
                .set("sasl.password", &security.password);
        }

        // validated against the allow-list when the config was loaded
        for (key, value) in &config.kafka_properties {
            client_config.set(key, value);
        }

        client_config
    }
}

impl BrokerFactory for KafkaBrokerFactory {
    type Broker = KafkaBroker;

    fn create(&self, topic: &str, group_id: &str) -> Result<KafkaBroker, BrokerError> {
        let consumer: BaseConsumer<KafkaContext> = self
            .client_config(group_id)
            .create_with_context(KafkaContext::new(topic))?;

        Ok(KafkaBroker {
            topic: topic.to_string(),
            consumer: Some(consumer),
            wake: Arc::new(WakeFlag::default()),
        })
    }
}

fn to_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        tpl.add_partition(&partition.topic, partition.partition);
    }
    tpl
}

fn from_tpl(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()))
        .collect()
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| (header.key.to_string(), header.value.map(<[u8]>::to_vec)))
                .collect()
        })
        .unwrap_or_default();

    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
        headers,
        timestamp: message.timestamp().to_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config() {
        let config = ConsumerConfig::builder()
            .brokers("kafka:9092")
            .kafka_property("heartbeat.interval.ms", "3000")
            .build();
        let factory = KafkaBrokerFactory::new(config);
        let client_config = factory.client_config("live.orders");

        assert_eq!(client_config.get("group.id"), Some("live.orders"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(
            client_config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(client_config.get("isolation.level"), Some("read_committed"));
        assert_eq!(client_config.get("heartbeat.interval.ms"), Some("3000"));
        assert_eq!(client_config.get("sasl.username"), None);
    }

    #[test]
    fn test_partition_list_conversion() {
        let partitions = vec![TopicPartition::new("orders", 0), TopicPartition::new("orders", 3)];
        assert_eq!(from_tpl(&to_tpl(&partitions)), partitions);
    }
}
