//! Consumer configuration structures

use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::retry::{RetryPolicies, RetryPolicy};
use crate::telemetry::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Lower bound applied to the configured poll timeout
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Extra client properties accepted in `kafka_properties`
pub const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Fetch settings
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    "fetch.error.backoff.ms",
    "fetch.message.max.bytes",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    "receive.buffer.bytes",
    "send.buffer.bytes",
    // Group settings
    "heartbeat.interval.ms",
    "group.instance.id",
    // Connection settings
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    // TLS
    "ssl.ca.location",
    "ssl.certificate.location",
    "ssl.key.location",
    "enable.ssl.certificate.verification",
    // Monitoring
    "enable.metrics.push",
];

/// Durations stored as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as milliseconds
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize a duration from milliseconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// SASL credentials for the broker connection
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// `security.protocol`, e.g. `SASL_SSL`
    pub protocol: String,
    /// `sasl.mechanisms`, e.g. `PLAIN` or `SCRAM-SHA-512`
    pub sasl_mechanism: String,
    /// SASL username
    pub username: String,
    /// SASL password
    pub password: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("protocol", &self.protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Fetch and client-side buffering knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchTuning {
    /// `fetch.min.bytes`
    pub fetch_min_bytes: u32,
    /// `fetch.wait.max.ms`
    pub fetch_wait_max_ms: u32,
    /// `queued.max.messages.kbytes`
    pub queued_max_messages_kbytes: u32,
    /// `queued.min.messages`
    pub queued_min_messages: u32,
    /// `statistics.interval.ms` (0 disables statistics)
    pub statistics_interval_ms: u32,
}

impl Default for FetchTuning {
    fn default() -> Self {
        Self {
            fetch_min_bytes: 1_048_576,
            fetch_wait_max_ms: 50,
            queued_max_messages_kbytes: 1_048_576,
            queued_min_messages: 10_000,
            statistics_interval_ms: 0,
        }
    }
}

/// Multi-topic consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Client id reported to the broker
    pub client_id: String,

    /// Topics to consume; one poll loop per topic
    pub topics: Vec<String>,

    /// Consumer group id is `<prefix>.<topic>`
    pub group_id_prefix: String,

    /// Offset reset policy (earliest, latest)
    pub auto_offset_reset: String,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Maximum poll interval in milliseconds
    pub max_poll_interval_ms: u32,

    /// `read_committed` or `read_uncommitted`
    pub isolation_level: String,

    /// Let the broker create missing topics on subscribe
    pub allow_auto_create_topics: bool,

    /// SASL settings; plaintext when absent
    pub security: Option<SecurityConfig>,

    /// Fetch tuning
    pub fetch: FetchTuning,

    /// Additional Kafka properties, restricted to [`ALLOWED_KAFKA_PROPS`]
    pub kafka_properties: HashMap<String, String>,

    /// Maximum records per fetch
    pub poll_batch_size: usize,

    /// Maximum wait per fetch
    #[serde(rename = "poll_timeout_ms", with = "duration_ms")]
    pub poll_timeout: Duration,

    /// Workers per topic
    pub worker_count: usize,

    /// Capacity of each topic's work queue
    pub work_queue_capacity: usize,

    /// Pause fetching at this queue occupancy fraction
    pub pause_fraction: f64,

    /// Resume fetching at this queue occupancy fraction
    pub resume_fraction: f64,

    /// Commit after this many acknowledgements
    pub commit_batch_size: usize,

    /// Commit at least this often while acknowledgements arrive
    #[serde(rename = "commit_interval_ms", with = "duration_ms")]
    pub commit_interval: Duration,

    /// Maximum time to drain in-flight work on stop
    #[serde(rename = "shutdown_drain_timeout_ms", with = "duration_ms")]
    pub shutdown_drain_timeout: Duration,

    /// Wait per worker when joining the pool on stop
    #[serde(rename = "worker_join_timeout_ms", with = "duration_ms")]
    pub worker_join_timeout: Duration,

    /// Fetch timeout while fetched records wait for queue space
    #[serde(rename = "enqueue_backoff_ms", with = "duration_ms")]
    pub enqueue_backoff: Duration,

    /// Retry admission policies
    pub retry: RetryPolicies,

    /// Logging setup for the binary
    pub logging: LoggingConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "topic-worker".to_string(),
            topics: Vec::new(),
            group_id_prefix: "topic-worker".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 45_000,
            max_poll_interval_ms: 300_000,
            isolation_level: "read_committed".to_string(),
            allow_auto_create_topics: false,
            security: None,
            fetch: FetchTuning::default(),
            kafka_properties: HashMap::new(),
            poll_batch_size: 1000,
            poll_timeout: Duration::from_millis(1000),
            worker_count: num_cpus::get(),
            work_queue_capacity: 50_000,
            pause_fraction: 0.8,
            resume_fraction: 0.3,
            commit_batch_size: 5000,
            commit_interval: Duration::from_millis(500),
            shutdown_drain_timeout: Duration::from_secs(60),
            worker_join_timeout: Duration::from_secs(1),
            enqueue_backoff: Duration::from_millis(1),
            retry: RetryPolicies::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.brokers = brokers.into();
        self
    }

    /// Set the client id
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set the topics to consume
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Set the consumer group prefix
    pub fn group_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.group_id_prefix = prefix.into();
        self
    }

    /// Set the security settings
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = Some(security);
        self
    }

    /// Set the fetch batch size
    pub fn poll_batch_size(mut self, size: usize) -> Self {
        self.config.poll_batch_size = size;
        self
    }

    /// Set the fetch timeout
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    /// Set the number of workers per topic
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Set the work queue capacity
    pub fn work_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.work_queue_capacity = capacity;
        self
    }

    /// Set the pause and resume occupancy fractions
    pub fn flow_fractions(mut self, pause: f64, resume: f64) -> Self {
        self.config.pause_fraction = pause;
        self.config.resume_fraction = resume;
        self
    }

    /// Set the acknowledgement count that triggers a commit
    pub fn commit_batch_size(mut self, size: usize) -> Self {
        self.config.commit_batch_size = size;
        self
    }

    /// Set the time that triggers a commit
    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.config.commit_interval = interval;
        self
    }

    /// Set the drain window used on stop
    pub fn shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_drain_timeout = timeout;
        self
    }

    /// Set the per-worker join timeout used on stop
    pub fn worker_join_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_join_timeout = timeout;
        self
    }

    /// Set the retry policy for topics without an override
    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry.default = policy;
        self
    }

    /// Override the retry budget for one topic
    pub fn max_retries(mut self, topic: &str, max_retries: u32) -> Self {
        self.config.retry.topic_mut(topic).max_retries = max_retries;
        self
    }

    /// Override the retry backoff for one topic
    pub fn retry_backoff(mut self, topic: &str, backoff: Duration) -> Self {
        self.config.retry.topic_mut(topic).backoff = backoff;
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.kafka_properties.insert(key.into(), value.into());
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ConsumerResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ConsumerError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate().map_err(ConsumerError::ConfigError)?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ConsumerError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Consumer group used for `topic`
    pub fn group_id(&self, topic: &str) -> String {
        format!("{}.{}", self.group_id_prefix, topic)
    }

    /// Poll timeout with the lower bound applied
    pub fn effective_poll_timeout(&self) -> Duration {
        self.poll_timeout.max(MIN_POLL_TIMEOUT)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id_prefix.is_empty() {
            return Err("Group id prefix cannot be empty".to_string());
        }

        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err("Topic names cannot be empty".to_string());
        }

        if self.poll_batch_size == 0 {
            return Err("Poll batch size must be greater than 0".to_string());
        }

        if self.worker_count == 0 {
            return Err("Number of workers must be greater than 0".to_string());
        }

        if self.work_queue_capacity == 0 {
            return Err("Work queue capacity must be greater than 0".to_string());
        }

        if self.commit_batch_size == 0 {
            return Err("Commit batch size must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.pause_fraction)
            || !(0.0..=1.0).contains(&self.resume_fraction)
        {
            return Err("Pause and resume fractions must be between 0 and 1".to_string());
        }

        if self.pause_fraction <= self.resume_fraction {
            return Err("Pause fraction must be greater than resume fraction".to_string());
        }

        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(format!(
                "Unsupported auto_offset_reset '{}'",
                self.auto_offset_reset
            ));
        }

        if !matches!(
            self.isolation_level.as_str(),
            "read_committed" | "read_uncommitted"
        ) {
            return Err(format!(
                "Unsupported isolation_level '{}'",
                self.isolation_level
            ));
        }

        if let Some(key) = self
            .kafka_properties
            .keys()
            .find(|key| !ALLOWED_KAFKA_PROPS.contains(&key.as_str()))
        {
            return Err(format!(
                "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                key, ALLOWED_KAFKA_PROPS
            ));
        }

        Ok(())
    }
}
