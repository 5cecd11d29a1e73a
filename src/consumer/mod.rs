//! Multi-topic consumer runtime
//!
//! This module provides:
//! - One broker-facing poll loop per topic, on its own thread
//! - A bounded work queue with pause/resume backpressure
//! - A worker pool with per-record retry admission
//! - Highest-seen offset commits on a batch-or-interval schedule
//! - Flush-before-release handling of cooperative revokes
//! - Graceful, bounded shutdown
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "kafka")]
//! # async fn example() -> anyhow::Result<()> {
//! use topic_worker::consumer::{ConsumerConfig, ConsumerSupervisor, Dispatcher, KafkaBrokerFactory};
//!
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092")
//!     .group_id_prefix("billing")
//!     .max_retries("payments", 10)
//!     .build();
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register_fn("payments", |record| record.value.is_some());
//!
//! let supervisor = ConsumerSupervisor::new(
//!     config.clone(),
//!     KafkaBrokerFactory::new(config),
//!     dispatcher,
//! )?;
//! supervisor.start_registered().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! supervisor.stop_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod metrics;
pub mod offsets;
pub mod poll_loop;
pub mod queue;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backpressure::{FlowControl, FlowDecision};
pub use broker::{
    BrokerClient, BrokerFactory, CommitMode, Fetched, PartitionControl, RebalanceListener, Wakeup,
};
pub use config::{ConsumerConfig, ConsumerConfigBuilder, FetchTuning, SecurityConfig};
pub use dispatcher::{Dispatcher, FnHandler, RecordHandler, UnhandledRecord};
pub use error::{BrokerError, ConsumerError, ConsumerResult, HandlerError};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerFactory};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use offsets::{CommitCursor, CommitSchedule};
pub use poll_loop::{Assignment, PollLoop, TopicCore, TopicHandle, TopicState};
pub use queue::{ack_channel, AckReceiver, AckSender, WorkItem, WorkQueue};
pub use record::{AckSignal, CommitOffset, Record, RecordKey, TopicPartition};
pub use retry::{Admission, RetryLedger, RetryPolicies, RetryPolicy};
pub use shutdown::{ShutdownState, StopHandle};
pub use supervisor::ConsumerSupervisor;
pub use worker::{RecordState, WorkerContext, WorkerPool};
