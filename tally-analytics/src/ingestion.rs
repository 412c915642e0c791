use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;

use tally_system::{
    Addr, AsyncResponse, FromMessage, Interface, Receiver, Request, Sender, Service,
    ShutdownHandle,
};
use tokio::time::Instant;

use crate::clock::Clock;
use crate::recorder::Recorder;
use crate::sink::EventSink;
use crate::statsd::{AnalyticsCounters, AnalyticsTimers};
use crate::store::AnalyticsStore;
use crate::{AnalyticsError, Event, Operation, ResourceId};

/// Result of recording an event: whether it was the first access of its client today.
pub type RecordResult = Result<bool, AnalyticsError>;

/// Records a single event.
///
/// The response resolves once the ingestion service has applied the event.
#[derive(Debug)]
pub struct RecordEvent {
    event: Event,
    received: Instant,
}

impl RecordEvent {
    /// Creates the message for an event.
    pub fn new(event: Event) -> Self {
        Self {
            event,
            received: Instant::now(),
        }
    }
}

/// Interface of the [`IngestionService`].
#[derive(Debug)]
pub enum Ingest {
    /// Records an event.
    Record(RecordEvent, Sender<RecordResult>),
}

impl Interface for Ingest {}

impl FromMessage<RecordEvent> for Ingest {
    type Response = AsyncResponse<RecordResult>;

    fn from_message(message: RecordEvent, sender: Sender<RecordResult>) -> Self {
        Self::Record(message, sender)
    }
}

/// Single consumer of the ingestion queue.
///
/// Events are applied strictly in the order they were enqueued. After applying an event to the
/// analytics store, the service writes it to the [`EventSink`]. Failures of either side are
/// logged and do not affect the other.
///
/// On shutdown, the service stops accepting new events and applies all events that are already
/// queued before it stops.
pub struct IngestionService<S, K> {
    recorder: Recorder<S>,
    sink: K,
    shutdown: ShutdownHandle,
}

impl<S: AnalyticsStore, K: EventSink> IngestionService<S, K> {
    /// Creates a new ingestion service.
    pub fn new(recorder: Recorder<S>, sink: K, shutdown: ShutdownHandle) -> Self {
        Self {
            recorder,
            sink,
            shutdown,
        }
    }

    async fn handle_message(&self, message: Ingest) {
        match message {
            Ingest::Record(record, sender) => {
                let result = self.handle_record(record).await;
                sender.send(result);
            }
        }
    }

    async fn handle_record(&self, record: RecordEvent) -> RecordResult {
        let RecordEvent { event, received } = record;
        let operation = event.operation.as_str();

        tally_statsd::metric!(timer(AnalyticsTimers::QueueWait) = received.elapsed());

        let result = tally_statsd::metric!(
            timer(AnalyticsTimers::RecordDuration),
            operation = operation,
            { self.recorder.apply(&event).await }
        );

        match &result {
            Ok(first_today) => {
                tally_statsd::metric!(
                    counter(AnalyticsCounters::EventsRecorded) += 1,
                    operation = operation,
                );
                if *first_today {
                    tally_statsd::metric!(
                        counter(AnalyticsCounters::FirstToday) += 1,
                        operation = operation,
                    );
                }
            }
            Err(error) => {
                tally_log::warn!(
                    error = error as &dyn Error,
                    resource = %event.resource,
                    operation,
                    "failed to record analytics event"
                );
                tally_statsd::metric!(counter(AnalyticsCounters::RecordFailed) += 1);
            }
        }

        if let Err(error) = self.sink.write(&event).await {
            tally_log::warn!(
                error = &error as &dyn Error,
                resource = %event.resource,
                "failed to persist analytics event"
            );
            tally_statsd::metric!(counter(AnalyticsCounters::SinkFailed) += 1);
        }

        result
    }
}

impl<S: AnalyticsStore, K: EventSink> Service for IngestionService<S, K> {
    type Interface = Ingest;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        let mut shutdown = self.shutdown.clone();
        tally_log::info!("ingestion service started");

        loop {
            tokio::select! {
                biased;

                Some(message) = rx.recv() => self.handle_message(message).await,
                _ = shutdown.notified() => {
                    rx.close();
                    let pending = rx.len();
                    if pending > 0 {
                        tally_log::info!("draining {pending} queued analytics events");
                    }
                    while let Some(message) = rx.recv().await {
                        self.handle_message(message).await;
                    }
                    break;
                }
                else => break,
            }
        }

        tally_log::info!("ingestion service stopped");
    }
}

/// Entry point for recording events.
///
/// The handle stamps events with the current time and hands them to the [`IngestionService`].
/// Its queue is bounded, so enqueueing waits while the queue is full. Events are never dropped
/// silently. Callers that cannot tolerate waiting apply their own timeout.
#[derive(Clone, Debug)]
pub struct AnalyticsHandle {
    addr: Addr<Ingest>,
    clock: Arc<dyn Clock>,
}

impl AnalyticsHandle {
    /// Creates a handle from the address of a running ingestion service.
    pub fn new(addr: Addr<Ingest>, clock: Arc<dyn Clock>) -> Self {
        Self { addr, clock }
    }

    /// Enqueues an event, waiting for capacity if the queue is full.
    ///
    /// Returns a request that resolves once the event has been applied. Dropping the request does
    /// not cancel the event.
    pub async fn enqueue(&self, event: Event) -> Result<Request<RecordResult>, AnalyticsError> {
        Ok(self.addr.send(RecordEvent::new(event)).await?)
    }

    /// Records an access and returns whether it is the first access of `ip` today.
    ///
    /// Fails with [`AnalyticsError::QueueClosed`] once the ingestion service has shut down, and
    /// with a store error if the event could not be applied. Callers must not fail their primary
    /// work because of either.
    pub async fn record(
        &self,
        resource: ResourceId,
        operation: Operation,
        subject_id: Option<i64>,
        ip: IpAddr,
        user_agent: impl Into<String>,
        dedup_token: impl Into<String>,
    ) -> RecordResult {
        let event = Event {
            resource,
            operation,
            subject_id,
            client_ip: ip,
            user_agent: user_agent.into(),
            dedup_token: dedup_token.into(),
            timestamp: self.clock.now(),
        };

        self.enqueue(event).await?.await?
    }

    /// Returns the number of events waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.addr.queue_len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use tally_system::Controller;

    use super::*;
    use crate::clock::{Calendar, ManualClock};
    use crate::dedup::DedupGuard;
    use crate::namespace::KeyNamespace;
    use crate::sink::{NoopSink, SinkError};
    use crate::store::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[derive(Clone, Debug, Default)]
    struct CollectSink(Arc<Mutex<Vec<ResourceId>>>);

    impl EventSink for CollectSink {
        async fn write(&self, event: &Event) -> Result<(), SinkError> {
            self.0.lock().push(event.resource);
            Ok(())
        }
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        async fn write(&self, _event: &Event) -> Result<(), SinkError> {
            Err(SinkError("database unavailable".into()))
        }
    }

    fn start<K: EventSink>(
        sink: K,
        controller: &Controller,
    ) -> (AnalyticsHandle, MemoryStore, tokio::task::JoinHandle<()>) {
        let clock = Arc::new(ManualClock::new(now()));
        let store = MemoryStore::new(clock.clone());
        let calendar = Calendar::new(0, clock.clone()).unwrap();
        let namespace = KeyNamespace::default();
        let dedup = DedupGuard::new(
            store.clone(),
            namespace.clone(),
            calendar.clone(),
            Duration::from_secs(86_400),
        );
        let recorder = Recorder::new(store.clone(), namespace, calendar, dedup);

        let service = IngestionService::new(recorder, sink, controller.shutdown_handle());
        let (addr, join) = service.start(1000);
        (AnalyticsHandle::new(addr, clock), store, join)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_record_returns_first_today() {
        let controller = Controller::new(Duration::from_secs(1));
        let (handle, store, _join) = start(NoopSink, &controller);

        let download = Operation::Download;
        let first = handle.record(ResourceId(42), download, None, ip(1), "", "t1");
        assert!(first.await.unwrap());
        let second = handle.record(ResourceId(42), download, None, ip(1), "", "t1");
        assert!(!second.await.unwrap());

        let total = store.get_int("analytics:42:download:total:pv").await.unwrap();
        assert_eq!(total, Some(2));
    }

    #[tokio::test]
    async fn test_sink_receives_events_in_order() {
        let controller = Controller::new(Duration::from_secs(1));
        let sink = CollectSink::default();
        let (handle, _store, _join) = start(sink.clone(), &controller);

        for id in 1..=5 {
            let resource = ResourceId(id);
            handle
                .record(resource, Operation::PageView, None, ip(1), "", "")
                .await
                .unwrap();
        }

        let expected: Vec<_> = (1..=5).map(ResourceId).collect();
        assert_eq!(*sink.0.lock(), expected);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_record() {
        let controller = Controller::new(Duration::from_secs(1));
        let (handle, store, _join) = start(FailingSink, &controller);

        let result = handle.record(ResourceId(1), Operation::Update, Some(9), ip(1), "", "");
        assert!(result.await.unwrap());

        let views = store.hget("analytics:1:update:day:pv", "2024-03-10");
        assert_eq!(views.await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let controller = Controller::new(Duration::from_secs(1));
        let sink = CollectSink::default();
        let (handle, store, join) = start(sink.clone(), &controller);

        let mut requests = Vec::new();
        for last in 1..=10 {
            let event = Event {
                resource: ResourceId(3),
                operation: Operation::Download,
                subject_id: None,
                client_ip: ip(last),
                user_agent: String::new(),
                dedup_token: String::new(),
                timestamp: now(),
            };
            requests.push(handle.enqueue(event).await.unwrap());
        }

        controller.shutdown(None);
        join.await.unwrap();

        for request in requests {
            assert!(request.await.unwrap().unwrap());
        }
        assert_eq!(sink.0.lock().len(), 10);
        let total = store.get_int("analytics:3:download:total:pv").await.unwrap();
        assert_eq!(total, Some(10));

        let closed = handle.record(ResourceId(3), Operation::Download, None, ip(1), "", "");
        assert!(matches!(closed.await, Err(AnalyticsError::QueueClosed)));
    }

    #[test]
    fn test_record_metrics() {
        let captures = tally_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let controller = Controller::new(Duration::from_secs(1));
                let (handle, _store, _join) = start(NoopSink, &controller);
                for _ in 0..2 {
                    handle
                        .record(ResourceId(1), Operation::Download, None, ip(1), "", "")
                        .await
                        .unwrap();
                }
            });
        });

        let counters: Vec<_> = captures
            .into_iter()
            .filter(|metric| metric.contains("|c"))
            .collect();

        assert_eq!(
            counters,
            [
                "analytics.events.recorded:1|c|#operation:download",
                "analytics.events.first_today:1|c|#operation:download",
                "analytics.events.recorded:1|c|#operation:download",
            ]
        );
    }
}
