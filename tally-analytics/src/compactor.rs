use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::clock::Calendar;
use crate::namespace::{Granularity, KeyNamespace, format_date};
use crate::statsd::{AnalyticsCounters, AnalyticsTimers};
use crate::store::{AnalyticsStore, KeyTtl};
use crate::AnalyticsError;

fn is_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Parameters of the [`Compactor`].
#[derive(Clone, Copy, Debug)]
pub struct CompactorOptions {
    /// Number of keys requested per scan.
    pub scan_batch_size: usize,
    /// Number of minute buckets that stay in the realtime hashes.
    pub realtime_minutes: u32,
    /// Expiry set on raw day sketches once their day has been finalized.
    pub sketch_expiry: Duration,
}

/// Outcome of a compaction pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CompactionReport {
    /// Number of raw day sketches inspected.
    pub sketches_scanned: u64,
    /// Number of finalized counts written to the durable day hashes.
    pub snapshots_written: u64,
    /// Number of raw day sketches that received their expiry.
    pub expiries_set: u64,
    /// Number of realtime hashes inspected.
    pub realtime_keys_scanned: u64,
    /// Number of stale minute buckets moved into a daily rank.
    pub minutes_folded: u64,
    /// `false` if the pass stopped at its deadline before scanning all keys.
    pub complete: bool,
}

/// Background job finalizing past days and folding stale realtime buckets.
///
/// A pass scans all raw day sketches and all realtime hashes:
///
///  - Sketches of days before today are counted once and the count is stored in the durable
///    per-date hash of their granularity. The sketch itself receives an expiry and is left to
///    expire instead of being deleted, so late readers still find it.
///  - Minute buckets that have left the realtime window are added to the daily rank of their
///    operation and removed from the realtime hash.
///
/// Every mutation is individually idempotent, so an interrupted pass is safely resumed by the
/// next one. Passes are mutually exclusive within a process. Across processes, writing snapshots
/// with set-if-absent and claiming minute buckets by deleting them before ranking keeps counts
/// exact.
///
/// Clones share the exclusion lock.
#[derive(Clone, Debug)]
pub struct Compactor<S> {
    store: S,
    namespace: KeyNamespace,
    calendar: Calendar,
    options: CompactorOptions,
    lock: Arc<Mutex<()>>,
}

impl<S: AnalyticsStore> Compactor<S> {
    /// Creates a new compactor.
    pub fn new(
        store: S,
        namespace: KeyNamespace,
        calendar: Calendar,
        options: CompactorOptions,
    ) -> Self {
        Self {
            store,
            namespace,
            calendar,
            options,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Runs a full pass, waiting for a running pass to finish first.
    ///
    /// With a `deadline`, the pass stops scanning once the deadline has passed and reports
    /// itself as incomplete.
    pub async fn run_once(
        &self,
        deadline: Option<Instant>,
    ) -> Result<CompactionReport, AnalyticsError> {
        let _guard = self.lock.lock().await;
        self.pass(deadline).await
    }

    /// Runs a full pass unless another pass is running.
    ///
    /// Returns [`AnalyticsError::CompactionConflict`] if the lock is held.
    pub async fn try_run_once(
        &self,
        deadline: Option<Instant>,
    ) -> Result<CompactionReport, AnalyticsError> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| AnalyticsError::CompactionConflict)?;
        self.pass(deadline).await
    }

    async fn pass(&self, deadline: Option<Instant>) -> Result<CompactionReport, AnalyticsError> {
        let start = Instant::now();
        let mut report = CompactionReport::default();

        let result = self.scan_all(deadline, &mut report).await;

        tally_statsd::metric!(
            timer(AnalyticsTimers::CompactionDuration) = start.elapsed(),
            complete = if report.complete { "true" } else { "false" },
        );

        result?;

        if report.complete {
            tally_log::info!(
                snapshots = report.snapshots_written,
                expiries = report.expiries_set,
                minutes_folded = report.minutes_folded,
                "compaction pass finished"
            );
        } else {
            tally_log::warn!(
                sketches_scanned = report.sketches_scanned,
                realtime_keys_scanned = report.realtime_keys_scanned,
                "compaction pass hit its deadline, resuming next cycle"
            );
        }

        Ok(report)
    }

    async fn scan_all(
        &self,
        deadline: Option<Instant>,
        report: &mut CompactionReport,
    ) -> Result<(), AnalyticsError> {
        let today = self.calendar.today();

        for granularity in Granularity::ALL {
            let pattern = self.namespace.sketch_pattern(granularity);
            let mut cursor = 0;

            loop {
                let (next, keys) = self.scan(cursor, &pattern).await?;
                for key in keys {
                    if is_expired(deadline) {
                        return Ok(());
                    }
                    self.finalize_sketch(&key, today, report).await?;
                }

                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }

        // The current and the previous minute still receive increments.
        let retained = self.options.realtime_minutes.saturating_sub(1).max(1);
        let horizon = self.calendar.now_minute() - i64::from(retained);
        let pattern = self.namespace.realtime_pattern();
        let mut cursor = 0;

        loop {
            let (next, keys) = self.scan(cursor, &pattern).await?;
            for key in keys {
                if is_expired(deadline) {
                    return Ok(());
                }
                self.fold_realtime(&key, horizon, report).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        report.complete = true;
        Ok(())
    }

    async fn scan(&self, cursor: u64, pattern: &str) -> Result<(u64, Vec<String>), AnalyticsError> {
        let batch = self
            .store
            .scan(cursor, pattern, self.options.scan_batch_size)
            .await;

        batch.map_err(|error| {
            tally_log::error!(
                error = &error as &dyn Error,
                phase = "scan",
                pattern,
                "compaction pass aborted"
            );
            AnalyticsError::Store(error)
        })
    }

    async fn finalize_sketch(
        &self,
        key: &str,
        today: NaiveDate,
        report: &mut CompactionReport,
    ) -> Result<(), AnalyticsError> {
        let sketch = match self.namespace.parse_sketch(key) {
            Ok(sketch) => sketch,
            Err(error) => {
                tally_log::warn!(error = &error as &dyn Error, "skipping foreign key");
                return Ok(());
            }
        };

        report.sketches_scanned += 1;
        if sketch.date >= today {
            return Ok(());
        }

        let result = async {
            let snapshot =
                self.namespace
                    .snapshot(sketch.resource, sketch.operation, sketch.granularity);
            let field = format_date(sketch.date);

            if !self.store.hexists(&snapshot, &field).await? {
                let count = self.store.pf_count(key).await?;
                let count = i64::try_from(count).unwrap_or(i64::MAX);
                if self.store.hset_nx(&snapshot, &field, count).await? {
                    report.snapshots_written += 1;
                    tally_statsd::metric!(
                        counter(AnalyticsCounters::Snapshots) += 1,
                        granularity = sketch.granularity.as_str(),
                    );
                }
            }

            if self.store.ttl(key).await? == KeyTtl::Persistent
                && self.store.expire(key, self.options.sketch_expiry).await?
            {
                report.expiries_set += 1;
            }

            Ok::<_, AnalyticsError>(())
        }
        .await;

        result.inspect_err(|error| {
            tally_log::error!(
                error = error as &dyn Error,
                phase = "snapshot",
                key,
                "compaction pass aborted"
            );
        })
    }

    async fn fold_realtime(
        &self,
        key: &str,
        horizon: i64,
        report: &mut CompactionReport,
    ) -> Result<(), AnalyticsError> {
        let (resource, operation) = match self.namespace.parse_realtime(key) {
            Ok(parsed) => parsed,
            Err(error) => {
                tally_log::warn!(error = &error as &dyn Error, "skipping foreign key");
                return Ok(());
            }
        };

        report.realtime_keys_scanned += 1;

        let result = async {
            let member = resource.to_string();

            for (field, _) in self.store.hgetall(key).await? {
                let Ok(minute) = field.parse::<i64>() else {
                    tally_log::warn!(key, field = %field, "skipping invalid minute bucket");
                    continue;
                };

                if minute >= horizon {
                    continue;
                }

                let Some(date) = self.calendar.date_of_minute(minute) else {
                    tally_log::warn!(key, field = %field, "skipping invalid minute bucket");
                    continue;
                };

                // Taking the field claims the bucket, so a concurrent pass cannot rank it again.
                let Some(count) = self.store.htake(key, &field).await? else {
                    continue;
                };

                if count > 0 {
                    let rank = self.namespace.rank(operation, date);
                    if let Err(error) = self.store.zincr(&rank, &member, count).await {
                        // Hand the views back to the bucket for the next pass.
                        self.store.hincr(key, &field, count).await?;
                        return Err(error.into());
                    }
                }

                report.minutes_folded += 1;
                tally_statsd::metric!(counter(AnalyticsCounters::MinutesFolded) += 1);
            }

            Ok::<_, AnalyticsError>(())
        }
        .await;

        result.inspect_err(|error| {
            tally_log::error!(
                error = error as &dyn Error,
                phase = "fold",
                key,
                "compaction pass aborted"
            );
        })
    }
}
