use std::error::Error;
use std::future::Future;

use crate::Event;

/// An error persisting an event in an [`EventSink`].
#[derive(Debug, thiserror::Error)]
#[error("failed to persist event")]
pub struct SinkError(#[source] pub Box<dyn Error + Send + Sync>);

/// Durable destination of raw events, such as a relational store.
///
/// The ingestion service writes every event to the sink after applying it to the analytics store.
/// Sink failures are logged and never affect analytics results, and analytics failures never
/// prevent or roll back the sink write.
pub trait EventSink: Send + Sync + 'static {
    /// Persists a single event.
    fn write(&self, event: &Event) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Sink discarding all events.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    async fn write(&self, _event: &Event) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that emits every event as a debug log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    async fn write(&self, event: &Event) -> Result<(), SinkError> {
        tally_log::debug!(
            resource = %event.resource,
            operation = %event.operation,
            subject_id = event.subject_id,
            client_ip = %event.client_ip,
            user_agent = %event.user_agent,
            timestamp = %event.timestamp,
            "analytics event"
        );
        Ok(())
    }
}
