use std::time::Duration;

use chrono::{NaiveDate, TimeDelta};
use serde::Serialize;

use crate::clock::Calendar;
use crate::namespace::{Granularity, KeyNamespace, format_date};
use crate::store::AnalyticsStore;
use crate::{AnalyticsError, Operation, ResourceId};

/// Number of days merged into a weekly sketch.
const WEEK_DAYS: i64 = 7;

/// Counts of a single day bucket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DayStats {
    /// The day bucket.
    pub date: NaiveDate,
    /// Approximate number of unique visitors.
    pub visitors: u64,
    /// Approximate number of unique authenticated users.
    pub members: u64,
    /// Exact number of page views.
    pub views: u64,
}

/// The read path of the analytics engine.
#[derive(Clone, Debug)]
pub struct QueryAssembler<S> {
    store: S,
    namespace: KeyNamespace,
    calendar: Calendar,
    realtime_minutes: u32,
    weekly_ttl: Duration,
}

impl<S: AnalyticsStore> QueryAssembler<S> {
    /// Creates a new query assembler.
    pub fn new(
        store: S,
        namespace: KeyNamespace,
        calendar: Calendar,
        realtime_minutes: u32,
        weekly_ttl: Duration,
    ) -> Self {
        Self {
            store,
            namespace,
            calendar,
            realtime_minutes,
            weekly_ttl,
        }
    }

    /// Returns the counts of the `days` day buckets ending with `end`, oldest first.
    ///
    /// Finalized days are read from the durable snapshots. Days that have not been finalized yet,
    /// including today, are counted from their live sketches. Page views are always exact.
    pub async fn day_series(
        &self,
        resource: ResourceId,
        operation: Operation,
        days: u32,
        end: NaiveDate,
    ) -> Result<Vec<DayStats>, AnalyticsError> {
        let dates: Vec<NaiveDate> = (0..i64::from(days))
            .rev()
            .filter_map(|offset| end.checked_sub_signed(TimeDelta::days(offset)))
            .collect();
        let fields: Vec<String> = dates.iter().copied().map(format_date).collect();

        let views = self.namespace.views(resource, operation);
        let views = self.store.hmget(&views, &fields).await?;
        let visitors = self
            .unique_counts(resource, operation, Granularity::Visitors, &dates, &fields)
            .await?;
        let members = self
            .unique_counts(resource, operation, Granularity::Members, &dates, &fields)
            .await?;

        let series = dates
            .into_iter()
            .zip(visitors)
            .zip(members)
            .zip(views)
            .map(|(((date, visitors), members), views)| DayStats {
                date,
                visitors,
                members,
                views: views.map_or(0, |v| v.max(0) as u64),
            })
            .collect();

        Ok(series)
    }

    async fn unique_counts(
        &self,
        resource: ResourceId,
        operation: Operation,
        granularity: Granularity,
        dates: &[NaiveDate],
        fields: &[String],
    ) -> Result<Vec<u64>, AnalyticsError> {
        let today = self.calendar.today();
        let snapshot = self.namespace.snapshot(resource, operation, granularity);
        let snapshots = self.store.hmget(&snapshot, fields).await?;

        let mut counts = Vec::with_capacity(dates.len());
        for (&date, snapshot) in dates.iter().zip(snapshots) {
            let count = match snapshot {
                Some(count) if date < today => count.max(0) as u64,
                _ => {
                    let sketch = self.namespace.sketch(resource, operation, granularity, date);
                    self.store.pf_count(&sketch).await?
                }
            };
            counts.push(count);
        }

        Ok(counts)
    }

    /// Returns the page views of the realtime window, oldest minute first.
    ///
    /// The window ends with the current minute. Minutes without views are `0`.
    pub async fn realtime_series(
        &self,
        resource: ResourceId,
        operation: Operation,
    ) -> Result<Vec<u64>, AnalyticsError> {
        let now = self.calendar.now_minute();
        let first = now - i64::from(self.realtime_minutes) + 1;
        let fields: Vec<String> = (first..=now).map(|minute| minute.to_string()).collect();

        let key = self.namespace.realtime(resource, operation);
        let values = self.store.hmget(&key, &fields).await?;

        Ok(values
            .into_iter()
            .map(|value| value.map_or(0, |v| v.max(0) as u64))
            .collect())
    }

    /// Returns the approximate number of unique visitors of the 7 days before `end`.
    ///
    /// Once every day of the window has ended, the merged sketch is cached and reused until it
    /// expires. Windows that still include today are counted live and never cached. Operations
    /// are never merged with each other.
    pub async fn weekly_unique(
        &self,
        resource: ResourceId,
        operation: Operation,
        end: NaiveDate,
    ) -> Result<u64, AnalyticsError> {
        let sources: Vec<String> = (1..=WEEK_DAYS)
            .rev()
            .filter_map(|offset| end.checked_sub_signed(TimeDelta::days(offset)))
            .map(|date| {
                self.namespace
                    .sketch(resource, operation, Granularity::Visitors, date)
            })
            .collect();

        if end > self.calendar.today() {
            return Ok(self.store.pf_count_union(&sources).await?);
        }

        let key = self.namespace.weekly(resource, operation, end);
        if !self.store.exists(&key).await? {
            self.store.pf_merge(&key, &sources).await?;
            self.store.expire(&key, self.weekly_ttl).await?;
        }

        Ok(self.store.pf_count(&key).await?)
    }

    /// Returns the resources with the most folded realtime views of a day, highest first.
    pub async fn daily_rank(
        &self,
        operation: Operation,
        date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<(ResourceId, u64)>, AnalyticsError> {
        let key = self.namespace.rank(operation, date);
        let members = self.store.zrevrange_withscores(&key, limit).await?;

        let mut rank = Vec::with_capacity(members.len());
        for (member, score) in members {
            match member.parse() {
                Ok(resource) => rank.push((resource, score.max(0.0) as u64)),
                Err(_) => tally_log::warn!(key = %key, member = %member, "skipping invalid rank member"),
            }
        }

        Ok(rank)
    }

    /// Returns the all-time page views of a resource.
    pub async fn total_views(
        &self,
        resource: ResourceId,
        operation: Operation,
    ) -> Result<u64, AnalyticsError> {
        let key = self.namespace.total(resource, operation);
        let total = self.store.get_int(&key).await?;
        Ok(total.map_or(0, |v| v.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::store::{KeyTtl, MemoryStore};

    use super::*;

    const WEEKLY_TTL: Duration = Duration::from_secs(15 * 86_400);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn setup() -> (QueryAssembler<MemoryStore>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(now()));
        let store = MemoryStore::new(clock.clone());
        let calendar = Calendar::new(0, clock).unwrap();
        let query = QueryAssembler::new(
            store.clone(),
            KeyNamespace::default(),
            calendar,
            15,
            WEEKLY_TTL,
        );
        (query, store)
    }

    #[tokio::test]
    async fn test_day_series_prefers_snapshots() {
        let (query, store) = setup();
        let resource = ResourceId(3);
        let op = Operation::Download;

        // Finalized day with a snapshot that differs from the raw sketch.
        store.pf_add("analytics:3:download:day:uv:2024-03-08", "a").await.unwrap();
        store.hset_nx("analytics:3:download:day:uv", "2024-03-08", 40).await.unwrap();
        // Past day without a snapshot yet.
        store.pf_add("analytics:3:download:day:uv:2024-03-09", "a").await.unwrap();
        store.pf_add("analytics:3:download:day:uv:2024-03-09", "b").await.unwrap();
        store.pf_add("analytics:3:download:day:member:2024-03-09", "1").await.unwrap();
        // Today is always live.
        store.pf_add("analytics:3:download:day:uv:2024-03-10", "c").await.unwrap();
        store.hincr("analytics:3:download:day:pv", "2024-03-10", 5).await.unwrap();

        let series = query.day_series(resource, op, 3, date(10)).await.unwrap();

        similar_asserts::assert_eq!(
            series,
            vec![
                DayStats {
                    date: date(8),
                    visitors: 40,
                    members: 0,
                    views: 0,
                },
                DayStats {
                    date: date(9),
                    visitors: 2,
                    members: 1,
                    views: 0,
                },
                DayStats {
                    date: date(10),
                    visitors: 1,
                    members: 0,
                    views: 5,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_day_series_empty() {
        let (query, _) = setup();
        let series = query
            .day_series(ResourceId(3), Operation::Update, 0, date(10))
            .await
            .unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn test_realtime_series_window() {
        let (query, store) = setup();
        let key = "analytics:3:page_view:realtime";
        let current = Calendar::epoch_minute(now());

        store.hincr(key, &current.to_string(), 4).await.unwrap();
        store.hincr(key, &(current - 14).to_string(), 2).await.unwrap();
        store.hincr(key, &(current - 15).to_string(), 9).await.unwrap();

        let series = query
            .realtime_series(ResourceId(3), Operation::PageView)
            .await
            .unwrap();

        assert_eq!(series.len(), 15);
        assert_eq!(series[0], 2);
        assert_eq!(series[14], 4);
        assert_eq!(series.iter().sum::<u64>(), 6);
    }

    #[tokio::test]
    async fn test_weekly_unique_is_cached() {
        let (query, store) = setup();
        let resource = ResourceId(3);
        let op = Operation::Download;

        store.pf_add("analytics:3:download:day:uv:2024-03-03", "a").await.unwrap();
        store.pf_add("analytics:3:download:day:uv:2024-03-09", "b").await.unwrap();
        // Outside of the window: the end date itself and the day before the window.
        store.pf_add("analytics:3:download:day:uv:2024-03-10", "c").await.unwrap();
        store.pf_add("analytics:3:download:day:uv:2024-03-02", "d").await.unwrap();
        // Other operations are never merged.
        store.pf_add("analytics:3:update:day:uv:2024-03-05", "e").await.unwrap();

        assert_eq!(query.weekly_unique(resource, op, date(10)).await.unwrap(), 2);

        let weekly = "analytics:3:download:weekly:2024-03-10";
        assert_eq!(store.ttl(weekly).await.unwrap(), KeyTtl::Expires(WEEKLY_TTL));

        // Later additions to the window do not change the cached value.
        store.pf_add("analytics:3:download:day:uv:2024-03-04", "f").await.unwrap();
        assert_eq!(query.weekly_unique(resource, op, date(10)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_weekly_unique_open_window_is_not_cached() {
        let (query, store) = setup();
        let resource = ResourceId(3);
        let op = Operation::Download;

        // Ending tomorrow, the window still contains today.
        store.pf_add("analytics:3:download:day:uv:2024-03-10", "a").await.unwrap();
        assert_eq!(query.weekly_unique(resource, op, date(11)).await.unwrap(), 1);
        assert!(!store.exists("analytics:3:download:weekly:2024-03-11").await.unwrap());

        store.pf_add("analytics:3:download:day:uv:2024-03-10", "b").await.unwrap();
        store.pf_add("analytics:3:download:day:uv:2024-03-10", "c").await.unwrap();
        assert_eq!(query.weekly_unique(resource, op, date(11)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_daily_rank() {
        let (query, store) = setup();
        let key = "analytics:day:rank:download:2024-03-10";
        store.zincr(key, "1", 3).await.unwrap();
        store.zincr(key, "2", 8).await.unwrap();
        store.zincr(key, "bogus", 100).await.unwrap();

        let rank = query
            .daily_rank(Operation::Download, date(10), 10)
            .await
            .unwrap();

        assert_eq!(rank, [(ResourceId(2), 8), (ResourceId(1), 3)]);
    }

    #[tokio::test]
    async fn test_total_views() {
        let (query, store) = setup();
        assert_eq!(query.total_views(ResourceId(3), Operation::Download).await.unwrap(), 0);

        store.incr("analytics:3:download:total:pv").await.unwrap();
        assert_eq!(query.total_views(ResourceId(3), Operation::Download).await.unwrap(), 1);
    }
}
