//! Topic to handler routing

use crate::consumer::error::HandlerError;
use crate::consumer::record::Record;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Business logic for the records of one topic
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    /// Process a single record
    async fn handle(&self, record: &Record) -> Result<(), HandlerError>;

    /// Get handler name for logs
    fn name(&self) -> &str {
        "RecordHandler"
    }
}

/// Adapter for plain `record -> bool` functions
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Record) -> bool + Send + Sync + 'static,
{
    /// Wrap a function under the given name
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> RecordHandler for FnHandler<F>
where
    F: Fn(&Record) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        if (self.f)(record) {
            Ok(())
        } else {
            Err(HandlerError::ProcessingError(format!(
                "{} rejected record",
                self.name
            )))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fallback for topics without a registered handler: logs and succeeds so
/// commits keep moving
#[derive(Debug, Default)]
pub struct UnhandledRecord;

#[async_trait]
impl RecordHandler for UnhandledRecord {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Unhandled record, no handler registered for topic"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "UnhandledRecord"
    }
}

/// Static topic to handler registry
///
/// Built once before consumers start; there is no way to swap handlers of a
/// running topic.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn RecordHandler>>,
    default: Arc<dyn RecordHandler>,
}

impl Dispatcher {
    /// Create a dispatcher that routes everything to [`UnhandledRecord`]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default: Arc::new(UnhandledRecord),
        }
    }

    /// Replace the fallback handler
    pub fn with_default(mut self, handler: impl RecordHandler) -> Self {
        self.default = Arc::new(handler);
        self
    }

    /// Register the handler for `topic`, replacing any previous one
    pub fn register(&mut self, topic: impl Into<String>, handler: impl RecordHandler) -> &mut Self {
        self.handlers.insert(topic.into(), Arc::new(handler));
        self
    }

    /// Register a `record -> bool` function for `topic`
    pub fn register_fn<F>(&mut self, topic: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        let topic = topic.into();
        let handler = FnHandler::new(topic.clone(), f);
        self.register(topic, handler)
    }

    /// Check if `topic` has its own handler
    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Topics with a registered handler, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn resolve(&self, topic: &str) -> &Arc<dyn RecordHandler> {
        self.handlers.get(topic).unwrap_or(&self.default)
    }

    /// Run the handler for the record's topic
    ///
    /// Errors and panics are logged and reported as `false`; nothing a
    /// handler does unwinds past this call.
    pub async fn dispatch(&self, record: &Record) -> bool {
        let handler = self.resolve(&record.topic);

        let outcome = AssertUnwindSafe(handler.handle(record))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => true,
            Err(HandlerError::Panicked(message)) => {
                warn!(
                    handler = handler.name(),
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    panic = %message,
                    "Record handler panicked"
                );
                false
            }
            Err(e) => {
                debug!(
                    handler = handler.name(),
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Record handler failed"
                );
                false
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
