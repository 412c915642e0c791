use std::sync::Arc;

use tally_system::{Addr, Service, ShutdownHandle};
use tokio::task::JoinHandle;

use crate::clock::{Calendar, Clock};
use crate::compactor::{Compactor, CompactorOptions};
use crate::config::AnalyticsConfig;
use crate::dedup::DedupGuard;
use crate::ingestion::{AnalyticsHandle, IngestionService};
use crate::namespace::KeyNamespace;
use crate::query::QueryAssembler;
use crate::recorder::Recorder;
use crate::scheduler::{Compaction, CompactorService};
use crate::sink::EventSink;
use crate::store::AnalyticsStore;
use crate::AnalyticsError;

/// Wires the components of the analytics engine to a single store.
///
/// All components share the store, the key namespace and the calendar. The engine itself holds no
/// state beyond that, so any number of engines in different processes can operate on the same
/// store.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tally_analytics::{Analytics, AnalyticsConfig, MemoryStore, SystemClock};
///
/// let clock = Arc::new(SystemClock);
/// let store = MemoryStore::new(clock.clone());
/// let analytics = Analytics::new(store, AnalyticsConfig::default(), clock).unwrap();
/// assert_eq!(analytics.config().queue_capacity(), 1000);
/// ```
#[derive(Clone, Debug)]
pub struct Analytics<S> {
    store: S,
    config: AnalyticsConfig,
    namespace: KeyNamespace,
    calendar: Calendar,
    compactor: Compactor<S>,
}

impl<S: AnalyticsStore> Analytics<S> {
    /// Creates an engine operating on `store`.
    ///
    /// Fails if the configured UTC offset is out of range.
    pub fn new(
        store: S,
        config: AnalyticsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AnalyticsError> {
        let calendar = Calendar::new(config.utc_offset_secs, clock)?;
        let namespace = KeyNamespace::new(config.key_prefix.clone());
        let options = CompactorOptions {
            scan_batch_size: config.scan_batch_size(),
            realtime_minutes: config.realtime_minutes(),
            sketch_expiry: config.sketch_expiry(),
        };
        let compactor = Compactor::new(store.clone(), namespace.clone(), calendar.clone(), options);

        Ok(Self {
            store,
            config,
            namespace,
            calendar,
            compactor,
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Returns the calendar deriving day and minute buckets.
    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Returns the key namespace.
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a guard for first-access checks.
    pub fn dedup(&self) -> DedupGuard<S> {
        DedupGuard::new(
            self.store.clone(),
            self.namespace.clone(),
            self.calendar.clone(),
            self.config.dedup_ttl(),
        )
    }

    /// Creates a recorder applying events synchronously.
    ///
    /// Most callers should record through the [`AnalyticsHandle`] returned by
    /// [`start_ingestion`](Self::start_ingestion) instead.
    pub fn recorder(&self) -> Recorder<S> {
        Recorder::new(
            self.store.clone(),
            self.namespace.clone(),
            self.calendar.clone(),
            self.dedup(),
        )
    }

    /// Creates a query assembler.
    pub fn query(&self) -> QueryAssembler<S> {
        QueryAssembler::new(
            self.store.clone(),
            self.namespace.clone(),
            self.calendar.clone(),
            self.config.realtime_minutes(),
            self.config.weekly_cache_ttl(),
        )
    }

    /// Returns the compactor of this engine.
    ///
    /// All returned compactors share one lock, so their passes never overlap.
    pub fn compactor(&self) -> Compactor<S> {
        self.compactor.clone()
    }

    /// Starts the ingestion service and returns a handle to record events.
    ///
    /// The join handle resolves once the service has drained its queue after `shutdown`.
    pub fn start_ingestion<K: EventSink>(
        &self,
        sink: K,
        shutdown: ShutdownHandle,
    ) -> (AnalyticsHandle, JoinHandle<()>) {
        let service = IngestionService::new(self.recorder(), sink, shutdown);
        let (addr, join) = service.start(self.config.queue_capacity());
        let handle = AnalyticsHandle::new(addr, self.calendar.clock().clone());
        (handle, join)
    }

    /// Starts the scheduled compaction service.
    pub fn start_compaction(&self, shutdown: ShutdownHandle) -> (Addr<Compaction>, JoinHandle<()>) {
        let service = CompactorService::new(
            self.compactor(),
            self.config.compaction_interval(),
            self.config.compaction_deadline(),
            shutdown,
        );
        service.start(16)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[test]
    fn test_invalid_offset() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()));
        let store = MemoryStore::new(clock.clone());
        let config = AnalyticsConfig {
            utc_offset_secs: 86_400,
            ..Default::default()
        };

        let result = Analytics::new(store, config, clock);
        assert!(matches!(result, Err(AnalyticsError::InvalidTimezone(86_400))));
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()));
        let store = MemoryStore::new(clock.clone());
        let config = AnalyticsConfig {
            key_prefix: "stats".to_owned(),
            ..Default::default()
        };
        let analytics = Analytics::new(store.clone(), config, clock).unwrap();

        let dedup = analytics.dedup();
        let first = dedup.first_today(
            crate::ResourceId(1),
            crate::Operation::Download,
            "10.0.0.1".parse().unwrap(),
        );
        assert!(first.await.unwrap());
        assert!(store.keys().iter().all(|key| key.starts_with("stats:")));
    }
}
