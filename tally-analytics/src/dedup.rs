use std::net::IpAddr;
use std::time::Duration;

use chrono::NaiveDate;

use crate::clock::Calendar;
use crate::namespace::KeyNamespace;
use crate::store::AnalyticsStore;
use crate::{AnalyticsError, Operation, ResourceId};

/// Gate admitting the first access of a client per resource, operation and day.
///
/// The marker is written with set-if-absent and expires on its own after the configured TTL. It
/// is never deleted explicitly.
#[derive(Clone, Debug)]
pub struct DedupGuard<S> {
    store: S,
    namespace: KeyNamespace,
    calendar: Calendar,
    ttl: Duration,
}

impl<S: AnalyticsStore> DedupGuard<S> {
    /// Creates a guard whose markers expire after `ttl`.
    pub fn new(store: S, namespace: KeyNamespace, calendar: Calendar, ttl: Duration) -> Self {
        Self {
            store,
            namespace,
            calendar,
            ttl,
        }
    }

    /// Returns `true` if this is the first access of `ip` today.
    ///
    /// Store failures are returned as errors and must not be read as "not first".
    pub async fn first_today(
        &self,
        resource: ResourceId,
        operation: Operation,
        ip: IpAddr,
    ) -> Result<bool, AnalyticsError> {
        self.first_on(resource, operation, self.calendar.today(), ip)
            .await
    }

    /// Returns `true` if this is the first access of `ip` on the given day bucket.
    pub async fn first_on(
        &self,
        resource: ResourceId,
        operation: Operation,
        date: NaiveDate,
        ip: IpAddr,
    ) -> Result<bool, AnalyticsError> {
        let key = self.namespace.dedup(resource, operation, date, ip);
        let first = self.store.set_nx_ex(&key, "1", self.ttl).await?;
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use chrono::{TimeDelta, TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::store::{KeyTtl, MemoryStore};

    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn setup() -> (DedupGuard<MemoryStore>, MemoryStore, Arc<ManualClock>) {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let store = MemoryStore::new(clock.clone());
        let calendar = Calendar::new(0, clock.clone()).unwrap();
        let guard = DedupGuard::new(store.clone(), KeyNamespace::default(), calendar, DAY);
        (guard, store, clock)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, last))
    }

    #[tokio::test]
    async fn test_first_once_per_ip() {
        let (guard, _, _) = setup();
        let resource = ResourceId(42);

        assert!(guard.first_today(resource, Operation::Download, ip(1)).await.unwrap());
        assert!(!guard.first_today(resource, Operation::Download, ip(1)).await.unwrap());
        assert!(guard.first_today(resource, Operation::Download, ip(2)).await.unwrap());

        // Operations and resources are gated independently.
        assert!(guard.first_today(resource, Operation::Update, ip(1)).await.unwrap());
        assert!(guard.first_today(ResourceId(43), Operation::Download, ip(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_expires() {
        let (guard, store, clock) = setup();
        let resource = ResourceId(42);

        assert!(guard.first_today(resource, Operation::Download, ip(1)).await.unwrap());

        let key = "analytics:dedup:42:download:2024-03-09:192.168.0.1";
        assert_eq!(store.ttl(key).await.unwrap(), KeyTtl::Expires(DAY));

        clock.advance(TimeDelta::days(1));
        assert_eq!(store.ttl(key).await.unwrap(), KeyTtl::Missing);

        // The next day has its own marker.
        assert!(guard.first_today(resource, Operation::Download, ip(1)).await.unwrap());
    }
}
