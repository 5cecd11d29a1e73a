//! Registry of running topic consumers

use crate::consumer::broker::BrokerFactory;
use crate::consumer::config::ConsumerConfig;
use crate::consumer::dispatcher::Dispatcher;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::metrics::MetricsSnapshot;
use crate::consumer::poll_loop::{PollLoop, TopicHandle, TopicState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Slack added on top of the drain and worker join budgets when waiting for
/// a loop thread to exit
const JOIN_MARGIN: Duration = Duration::from_secs(5);

/// Starts and stops one poll loop per topic
///
/// A topic whose loop died on a fatal broker error stays registered, in the
/// `Closed` state, until it is stopped or restarted; it is never restarted
/// automatically.
pub struct ConsumerSupervisor<F: BrokerFactory> {
    config: Arc<ConsumerConfig>,
    factory: F,
    dispatcher: Arc<Dispatcher>,
    runtime: Handle,
    topics: Mutex<HashMap<String, TopicHandle>>,
    /// Held for a whole start, so a restart never overlaps another start
    starting: tokio::sync::Mutex<()>,
}

impl<F: BrokerFactory> ConsumerSupervisor<F> {
    /// Create a supervisor hosting its workers on the current tokio runtime
    pub fn new(config: ConsumerConfig, factory: F, dispatcher: Dispatcher) -> ConsumerResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ConsumerError::RuntimeError(format!("consumer supervisor needs a tokio runtime: {}", e))
        })?;
        Self::with_runtime(config, factory, dispatcher, runtime)
    }

    /// Create a supervisor hosting its workers on the given runtime
    pub fn with_runtime(
        config: ConsumerConfig,
        factory: F,
        dispatcher: Dispatcher,
        runtime: Handle,
    ) -> ConsumerResult<Self> {
        config.validate().map_err(ConsumerError::ConfigError)?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            dispatcher: Arc::new(dispatcher),
            runtime,
            topics: Mutex::new(HashMap::new()),
            starting: tokio::sync::Mutex::new(()),
        })
    }

    /// Configuration shared by every topic
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Start consuming `topic` with the derived consumer group
    ///
    /// A topic that is already registered is stopped first.
    pub async fn start(&self, topic: &str) -> ConsumerResult<()> {
        let group_id = self.config.group_id(topic);
        self.start_with_group(topic, &group_id).await
    }

    /// Start consuming `topic` in an explicit consumer group
    ///
    /// Concurrent starts run one after another; the later one restarts the
    /// consumer the earlier one registered.
    pub async fn start_with_group(&self, topic: &str, group_id: &str) -> ConsumerResult<()> {
        if topic.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "Topic name cannot be empty".to_string(),
            ));
        }

        let _starting = self.starting.lock().await;
        if self.topics.lock().contains_key(topic) {
            info!(topic, "Consumer already registered, restarting");
            if let Err(e) = self.stop(topic).await {
                warn!(topic, error = %e, "Previous consumer stopped with error");
            }
        }

        let broker = self.factory.create(topic, group_id)?;
        let handle = PollLoop::spawn(
            broker,
            topic,
            group_id,
            &self.config,
            self.dispatcher.clone(),
            self.runtime.clone(),
        )?;

        info!(topic, group_id, workers = self.config.worker_count, "Consumer started");
        self.topics.lock().insert(topic.to_string(), handle);
        Ok(())
    }

    /// Start every topic in `topics`, stopping at the first failure
    pub async fn start_many<I, S>(&self, topics: I) -> ConsumerResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            self.start(topic.as_ref()).await?;
        }
        Ok(())
    }

    /// Start the topics listed in the configuration
    pub async fn start_configured(&self) -> ConsumerResult<()> {
        let topics = self.config.topics.clone();
        self.start_many(topics).await
    }

    /// Start one consumer per topic with a registered handler
    pub async fn start_registered(&self) -> ConsumerResult<Vec<String>> {
        let topics = self.dispatcher.topics();
        self.start_many(&topics).await?;
        Ok(topics)
    }

    /// Stop `topic`, draining its in-flight work
    ///
    /// Returns the loop's own result, so a loop that died on a fatal broker
    /// error reports it here. Unknown topics are ignored.
    pub async fn stop(&self, topic: &str) -> ConsumerResult<()> {
        let Some(handle) = self.topics.lock().remove(topic) else {
            debug!(topic, "Stop requested for unknown topic");
            return Ok(());
        };

        info!(topic, state = %handle.state(), "Stopping consumer");
        handle.request_stop();

        let timeout = self.join_timeout();
        tokio::task::spawn_blocking(move || handle.join(timeout))
            .await
            .map_err(|e| ConsumerError::ShutdownError(e.to_string()))?
    }

    /// Stop every registered topic concurrently
    ///
    /// All topics are stopped even if some report errors; the first error is
    /// returned.
    pub async fn stop_all(&self) -> ConsumerResult<()> {
        let topics = self.topics();
        let results = futures::future::join_all(topics.iter().map(|t| self.stop(t))).await;

        let mut first_error = None;
        for (topic, result) in topics.iter().zip(results) {
            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "Consumer stopped with error");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Lifecycle state of `topic`
    pub fn state(&self, topic: &str) -> Option<TopicState> {
        self.topics.lock().get(topic).map(|h| h.state())
    }

    /// Counters for `topic`
    pub fn metrics(&self, topic: &str) -> Option<MetricsSnapshot> {
        self.topics.lock().get(topic).map(|h| h.metrics())
    }

    /// Check if `topic` has a live poll loop
    pub fn is_running(&self, topic: &str) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|h| !h.is_finished())
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    fn join_timeout(&self) -> Duration {
        let workers = u32::try_from(self.config.worker_count).unwrap_or(u32::MAX);
        self.config.shutdown_drain_timeout
            + self.config.worker_join_timeout.saturating_mul(workers)
            + JOIN_MARGIN
    }
}

impl<F: BrokerFactory> Drop for ConsumerSupervisor<F> {
    fn drop(&mut self) {
        for handle in self.topics.lock().values() {
            handle.request_stop();
        }
    }
}
