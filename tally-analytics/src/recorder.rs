use crate::clock::Calendar;
use crate::dedup::DedupGuard;
use crate::namespace::{KeyNamespace, format_date};
use crate::store::AnalyticsStore;
use crate::{AnalyticsError, Event};

/// The write path of the analytics engine.
///
/// Applies a single event to all day, total and realtime structures, then consults the
/// [`DedupGuard`]. The recorder only ever adds to sketches and increments counters, so
/// concurrent recorders in other processes never lose updates.
#[derive(Clone, Debug)]
pub struct Recorder<S> {
    store: S,
    namespace: KeyNamespace,
    calendar: Calendar,
    dedup: DedupGuard<S>,
}

impl<S: AnalyticsStore> Recorder<S> {
    /// Creates a recorder writing to `store`.
    pub fn new(
        store: S,
        namespace: KeyNamespace,
        calendar: Calendar,
        dedup: DedupGuard<S>,
    ) -> Self {
        Self {
            store,
            namespace,
            calendar,
            dedup,
        }
    }

    /// Applies an event and returns whether it is the first access of its client today.
    ///
    /// Buckets are derived from the event's timestamp, not from the time of application. Any store
    /// failure aborts the remaining steps. Steps applied before the failure are not rolled back,
    /// which leaves counts slightly inconsistent but never corrupt.
    pub async fn apply(&self, event: &Event) -> Result<bool, AnalyticsError> {
        let resource = event.resource;
        let operation = event.operation;
        let date = self.calendar.date_of(event.timestamp);
        let keys = self.namespace.day_keys(resource, operation, date);

        self.store.pf_add(&keys.visitors, &event.visitor_id()).await?;
        if let Some(member) = event.member_id() {
            self.store.pf_add(&keys.members, &member.to_string()).await?;
        }

        self.store.hincr(&keys.views, &format_date(date), 1).await?;
        let total = self.namespace.total(resource, operation);
        self.store.incr(&total).await?;

        let minute = Calendar::epoch_minute(event.timestamp);
        let realtime = self.namespace.realtime(resource, operation);
        self.store.hincr(&realtime, &minute.to_string(), 1).await?;

        self.dedup
            .first_on(resource, operation, date, event.client_ip)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::{Operation, ResourceId};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 15).unwrap()
    }

    fn setup() -> (Recorder<MemoryStore>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(now()));
        let store = MemoryStore::new(clock.clone());
        let calendar = Calendar::new(0, clock).unwrap();
        let namespace = KeyNamespace::default();
        let dedup = DedupGuard::new(
            store.clone(),
            namespace.clone(),
            calendar.clone(),
            Duration::from_secs(86_400),
        );
        let recorder = Recorder::new(store.clone(), namespace, calendar, dedup);
        (recorder, store)
    }

    fn event(subject_id: Option<i64>, token: &str) -> Event {
        Event {
            resource: ResourceId(7),
            operation: Operation::PageView,
            subject_id,
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            user_agent: String::new(),
            dedup_token: token.to_owned(),
            timestamp: now(),
        }
    }

    #[tokio::test]
    async fn test_apply_writes_all_structures() {
        let (recorder, store) = setup();

        assert!(recorder.apply(&event(Some(100), "")).await.unwrap());
        assert!(!recorder.apply(&event(None, "anon")).await.unwrap());

        let minute = (now().timestamp() / 60).to_string();

        similar_asserts::assert_eq!(
            store.keys(),
            [
                "analytics:7:page_view:day:member:2024-03-09",
                "analytics:7:page_view:day:pv",
                "analytics:7:page_view:day:uv:2024-03-09",
                "analytics:7:page_view:realtime",
                "analytics:7:page_view:total:pv",
                "analytics:dedup:7:page_view:2024-03-09:10.0.0.1",
            ]
        );

        let visitors = "analytics:7:page_view:day:uv:2024-03-09";
        let members = "analytics:7:page_view:day:member:2024-03-09";
        assert_eq!(store.pf_count(visitors).await.unwrap(), 2);
        assert_eq!(store.pf_count(members).await.unwrap(), 1);

        let views = "analytics:7:page_view:day:pv";
        assert_eq!(store.hget(views, "2024-03-09").await.unwrap(), Some(2));
        let total = "analytics:7:page_view:total:pv";
        assert_eq!(store.get_int(total).await.unwrap(), Some(2));
        let realtime = "analytics:7:page_view:realtime";
        assert_eq!(store.hget(realtime, &minute).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_anonymous_subject_skips_members() {
        let (recorder, store) = setup();

        recorder.apply(&event(Some(0), "abc")).await.unwrap();

        let members = "analytics:7:page_view:day:member:2024-03-09";
        assert!(!store.exists(members).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let (recorder, store) = setup();

        // Occupy the views hash with a value of the wrong type.
        store
            .pf_add("analytics:7:page_view:day:pv", "x")
            .await
            .unwrap();

        let result = recorder.apply(&event(None, "abc")).await;
        assert!(matches!(result, Err(AnalyticsError::Store(_))));

        // The visitor was added before the failure, later steps never ran.
        let visitors = "analytics:7:page_view:day:uv:2024-03-09";
        assert_eq!(store.pf_count(visitors).await.unwrap(), 1);
        let total = "analytics:7:page_view:total:pv";
        assert!(!store.exists(total).await.unwrap());
    }
}
