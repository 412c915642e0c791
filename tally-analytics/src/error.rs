use tally_system::SendError;

use crate::store::StoreError;

/// An error returned by the analytics engine.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// The key-value store failed or is temporarily unavailable.
    ///
    /// This error is transient. Callers may retry, but must never fail their primary request
    /// because of it.
    #[error("analytics store failed")]
    Store(#[from] StoreError),

    /// The ingestion service has shut down and no longer accepts events.
    #[error("analytics ingestion queue is closed")]
    QueueClosed,

    /// A compaction pass is already running.
    ///
    /// Returned only by [`Compactor::try_run_once`](crate::Compactor::try_run_once). Callers
    /// should skip the pass.
    #[error("compaction is already running")]
    CompactionConflict,

    /// A key in the store does not follow the key namespace.
    #[error("invalid analytics key {key:?}")]
    InvalidKeyShape {
        /// The offending key.
        key: String,
    },

    /// The configured UTC offset is out of range.
    #[error("invalid utc offset of {0} seconds")]
    InvalidTimezone(i32),
}

impl From<SendError> for AnalyticsError {
    fn from(_: SendError) -> Self {
        Self::QueueClosed
    }
}
