//! Usage analytics aggregation for downloadable resources.
//!
//! The engine records accesses to resources and answers questions about them: how many unique
//! visitors and authenticated users a resource had per day and per week, how many exact page views
//! it received, how many views arrived in each of the last minutes, and which resources were the
//! most viewed on a given day.
//!
//! # Architecture
//!
//! All state lives in an [`AnalyticsStore`], a key-value store with hashes, cardinality sketches
//! and sorted sets. Production deployments use Redis through the `redis` feature, while
//! [`MemoryStore`] serves single-process setups and tests. The engine holds no state of its own,
//! so several processes can share one store.
//!
//! - The [`Recorder`] applies single events. Events are usually submitted through the
//!   [`AnalyticsHandle`], which queues them for the [`IngestionService`]. The queue is bounded and
//!   applies backpressure once full.
//! - The [`DedupGuard`] decides whether an access is the first of its client today.
//! - The [`Compactor`] periodically finalizes past days into durable snapshots and folds stale
//!   realtime buckets into daily rankings. The [`CompactorService`] schedules it.
//! - The [`QueryAssembler`] builds day series, realtime series, weekly uniques and rankings.
//!
//! [`Analytics`] wires all of these to a store and a configuration.
//!
//! # Accuracy
//!
//! Page views are exact. Unique counts are HyperLogLog estimates with a standard error of about
//! one percent when backed by Redis. [`MemoryStore`] counts uniques exactly.
#![warn(missing_docs)]

mod clock;
mod compactor;
mod config;
mod dedup;
mod engine;
mod error;
mod event;
mod ingestion;
mod namespace;
mod query;
mod recorder;
mod scheduler;
mod sink;
mod statsd;
mod store;

pub use self::clock::*;
pub use self::compactor::*;
pub use self::config::*;
pub use self::dedup::*;
pub use self::engine::*;
pub use self::error::*;
pub use self::event::*;
pub use self::ingestion::*;
pub use self::namespace::*;
pub use self::query::*;
pub use self::recorder::*;
pub use self::scheduler::*;
pub use self::sink::*;
pub use self::store::*;
