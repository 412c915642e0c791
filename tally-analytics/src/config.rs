use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parameters of the analytics engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Prefix of all keys written to the store.
    ///
    /// Defaults to `analytics`.
    pub key_prefix: String,

    /// Offset of the service timezone east of UTC in seconds.
    ///
    /// Day buckets are calendar days in this timezone. Defaults to `0`.
    pub utc_offset_secs: i32,

    /// Maximum number of events waiting in the ingestion queue.
    ///
    /// Once the queue is full, recording waits for the ingestion service to catch up. Defaults to
    /// `1000`.
    pub queue_capacity: usize,

    /// Interval between scheduled compaction passes in seconds.
    ///
    /// A pass also runs at startup. Defaults to one hour.
    pub compaction_interval_secs: u64,

    /// Time in seconds after which a compaction pass abandons the rest of its scan.
    ///
    /// Defaults to `None`, i.e. passes always run to completion.
    pub compaction_deadline_secs: Option<u64>,

    /// Number of keys requested per `SCAN` call during compaction.
    ///
    /// Defaults to `500`.
    pub scan_batch_size: usize,

    /// Number of minute buckets in the realtime window.
    ///
    /// Realtime queries return this many minutes, and the compactor folds all older minutes into
    /// the daily rank. Defaults to `15`.
    pub realtime_minutes: u32,

    /// Lifetime of the first-access markers in seconds.
    ///
    /// Defaults to 24 hours.
    pub dedup_ttl_secs: u64,

    /// Lifetime of raw day sketches after their day has been finalized, in seconds.
    ///
    /// Defaults to 30 days.
    pub sketch_expiry_secs: u64,

    /// Lifetime of cached weekly sketches in seconds.
    ///
    /// Defaults to 15 days.
    pub weekly_cache_ttl_secs: u64,

    /// Time in seconds granted to the services to drain on a graceful shutdown.
    ///
    /// Defaults to `10`.
    pub shutdown_timeout_secs: u64,
}

impl AnalyticsConfig {
    /// Returns the capacity of the ingestion queue, at least `1`.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    /// Returns the interval between scheduled compaction passes.
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs.max(1))
    }

    /// Returns the optional deadline of a compaction pass.
    pub fn compaction_deadline(&self) -> Option<Duration> {
        self.compaction_deadline_secs.map(Duration::from_secs)
    }

    /// Returns the number of keys requested per scan, at least `1`.
    pub fn scan_batch_size(&self) -> usize {
        self.scan_batch_size.max(1)
    }

    /// Returns the number of minutes in the realtime window, at least `1`.
    pub fn realtime_minutes(&self) -> u32 {
        self.realtime_minutes.max(1)
    }

    /// Returns the lifetime of first-access markers.
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    /// Returns the lifetime of finalized raw day sketches.
    pub fn sketch_expiry(&self) -> Duration {
        Duration::from_secs(self.sketch_expiry_secs)
    }

    /// Returns the lifetime of cached weekly sketches.
    pub fn weekly_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.weekly_cache_ttl_secs)
    }

    /// Returns the graceful shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            key_prefix: "analytics".to_owned(),
            utc_offset_secs: 0,
            queue_capacity: 1000,
            compaction_interval_secs: 3600,
            compaction_deadline_secs: None,
            scan_batch_size: 500,
            realtime_minutes: 15,
            dedup_ttl_secs: 24 * 3600,
            sketch_expiry_secs: 30 * 24 * 3600,
            weekly_cache_ttl_secs: 15 * 24 * 3600,
            shutdown_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AnalyticsConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.key_prefix, "analytics");
        assert_eq!(config.queue_capacity(), 1000);
        assert_eq!(config.realtime_minutes(), 15);
        assert_eq!(config.dedup_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.sketch_expiry(), Duration::from_secs(2_592_000));
        assert_eq!(config.weekly_cache_ttl(), Duration::from_secs(1_296_000));
        assert_eq!(config.compaction_deadline(), None);
    }

    #[test]
    fn test_partial_override() {
        let yaml = r###"
key_prefix: "staging"
queue_capacity: 0
compaction_deadline_secs: 30
"###;

        let config: AnalyticsConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.key_prefix, "staging");
        assert_eq!(config.queue_capacity(), 1);
        assert_eq!(config.compaction_deadline(), Some(Duration::from_secs(30)));
        assert_eq!(config.scan_batch_size(), 500);
    }
}
