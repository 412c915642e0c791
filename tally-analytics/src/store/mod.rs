//! Capabilities of the key-value store backing the analytics engine.
//!
//! The engine never implements counting primitives itself. It orchestrates an atomic counter, a
//! hash with per-field atomic increments, a mergeable cardinality sketch and a sorted set, all
//! with per-key expiry. [`AnalyticsStore`] describes these capabilities in terms of the Redis
//! command set. [`RedisStore`] implements them on a Redis server and [`MemoryStore`] keeps
//! everything in process.

use std::future::Future;
use std::time::Duration;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use self::memory::*;
#[cfg(feature = "redis")]
pub use self::redis::*;

/// An error of the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Communication with Redis failed.
    #[cfg(feature = "redis")]
    #[error("failed to communicate with the store")]
    Redis(#[from] tally_redis::RedisError),

    /// An operation was applied to a value of an incompatible type.
    #[error("value at {key:?} holds the wrong kind of value")]
    WrongType {
        /// The key holding the value.
        key: String,
    },
}

/// Remaining lifetime of a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Converts the reply of the `TTL` command.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            -2 => Self::Missing,
            secs if secs < 0 => Self::Persistent,
            secs => Self::Expires(Duration::from_secs(secs as u64)),
        }
    }
}

/// Store capabilities required by the analytics engine.
///
/// Every operation is atomic on its own. Sketch counts are approximate and may carry the error of
/// the underlying cardinality estimator. Integer values are signed 64-bit integers.
pub trait AnalyticsStore: Clone + Send + Sync + 'static {
    /// Sets `key` to `value` with an expiry, only if the key does not exist yet.
    ///
    /// Returns `true` if the key was set by this call.
    fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Increments the counter at `key` by one and returns the new value.
    fn incr(&self, key: &str) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Returns the counter at `key`.
    fn get_int(&self, key: &str) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Increments a hash field by `delta` and returns the new value.
    fn hincr(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Returns the value of a hash field.
    fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Returns the values of several hash fields in the order of `fields`.
    fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> impl Future<Output = Result<Vec<Option<i64>>, StoreError>> + Send;

    /// Returns all fields and values of a hash.
    fn hgetall(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<(String, i64)>, StoreError>> + Send;

    /// Returns `true` if the hash field exists.
    fn hexists(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Sets a hash field only if it does not exist yet.
    ///
    /// Returns `true` if the field was set by this call.
    fn hset_nx(
        &self,
        key: &str,
        field: &str,
        value: i64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Removes a hash field and returns the value it had at removal.
    ///
    /// Reading and removing happen atomically, so increments are never lost in between. Returns
    /// `None` if the field does not exist.
    fn htake(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Adds an element to the sketch at `key`, creating the sketch if needed.
    ///
    /// Returns `true` if the estimated cardinality changed.
    fn pf_add(
        &self,
        key: &str,
        element: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Returns the approximate cardinality of the sketch at `key`, or `0` if it does not exist.
    fn pf_count(&self, key: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Returns the approximate cardinality of the union of the sketches at `keys`.
    ///
    /// Nothing is written. Missing keys count as empty sketches.
    fn pf_count_union(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Merges the sketches at `sources` into the sketch at `dest`.
    fn pf_merge(
        &self,
        dest: &str,
        sources: &[String],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns `true` if `key` exists.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Sets the expiry of `key`.
    ///
    /// Returns `false` if the key does not exist.
    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Returns the remaining lifetime of `key`.
    fn ttl(&self, key: &str) -> impl Future<Output = Result<KeyTtl, StoreError>> + Send;

    /// Increments the score of `member` in the sorted set at `key` and returns the new score.
    fn zincr(
        &self,
        key: &str,
        member: &str,
        delta: i64,
    ) -> impl Future<Output = Result<f64, StoreError>> + Send;

    /// Returns up to `limit` members of a sorted set with their scores, highest score first.
    fn zrevrange_withscores(
        &self,
        key: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(String, f64)>, StoreError>> + Send;

    /// Iterates over keys matching a glob `pattern`.
    ///
    /// Start with cursor `0` and pass the returned cursor to the next call. Iteration is complete
    /// when the returned cursor is `0`. Keys that exist for the whole iteration are returned at
    /// least once, keys may be returned more than once.
    fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> impl Future<Output = Result<(u64, Vec<String>), StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_reply() {
        assert_eq!(KeyTtl::from_secs(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_secs(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_secs(30),
            KeyTtl::Expires(Duration::from_secs(30))
        );
    }
}
