use tally_statsd::{CounterMetric, TimerMetric};

/// Counter metrics of the analytics engine.
pub enum AnalyticsCounters {
    /// Incremented for every event applied by the ingestion service.
    ///
    /// This metric is tagged with:
    ///  - `operation`: The recorded operation.
    EventsRecorded,
    /// Incremented for every event that was the first access of its client on that day.
    ///
    /// This metric is tagged with:
    ///  - `operation`: The recorded operation.
    FirstToday,
    /// Incremented for every event that could not be applied to the store.
    RecordFailed,
    /// Incremented for every event the event sink failed to persist.
    SinkFailed,
    /// Number of day sketches snapshotted into durable counts.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: `uv` or `member`.
    Snapshots,
    /// Number of realtime minute buckets folded into a daily rank.
    MinutesFolded,
    /// Incremented when a scheduled compaction is skipped because another pass is running.
    CompactionSkipped,
}

impl CounterMetric for AnalyticsCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::EventsRecorded => "analytics.events.recorded",
            Self::FirstToday => "analytics.events.first_today",
            Self::RecordFailed => "analytics.record.failed",
            Self::SinkFailed => "analytics.sink.failed",
            Self::Snapshots => "analytics.compaction.snapshots",
            Self::MinutesFolded => "analytics.compaction.minutes_folded",
            Self::CompactionSkipped => "analytics.compaction.skipped",
        }
    }
}

/// Timer metrics of the analytics engine.
pub enum AnalyticsTimers {
    /// Time taken to apply a single event to the store.
    ///
    /// This metric is tagged with:
    ///  - `operation`: The recorded operation.
    RecordDuration,
    /// Time an event spent in the ingestion queue before it was applied.
    QueueWait,
    /// Time taken by a compaction pass, including partial passes.
    ///
    /// This metric is tagged with:
    ///  - `complete`: `true` if the pass finished before its deadline.
    CompactionDuration,
}

impl TimerMetric for AnalyticsTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::RecordDuration => "analytics.record.duration",
            Self::QueueWait => "analytics.queue.wait",
            Self::CompactionDuration => "analytics.compaction.duration",
        }
    }
}
