//! Multi-topic Kafka consumer runtime
//!
//! `topic-worker` turns a stream of broker records into processed,
//! acknowledged and committed work. Each subscribed topic gets a dedicated
//! poll loop that owns its broker client, a bounded work queue feeding a
//! pool of async workers, and an offset cursor committed in batches.
//!
//! Delivery is at-least-once with bounded effort: a record whose handler
//! keeps failing is retried up to a per-topic budget and then acknowledged
//! anyway, so one poison record cannot stall a partition.
//!
//! The broker is reached through the [`consumer::BrokerClient`] trait. The
//! `kafka` feature provides an rdkafka-backed implementation.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Consumer runtime
pub mod consumer;

/// Logging setup
pub mod telemetry;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerResult, ConsumerSupervisor, Dispatcher, Record,
    RecordHandler, RetryPolicy, TopicState,
};
