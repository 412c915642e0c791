//! Abstraction over Redis caches.
//!
//! Provides [`RedisConfig`] to describe a single node or a cluster and [`AsyncRedisPool`], a
//! connection pool over either of them whose connections implement
//! [`redis::aio::ConnectionLike`].
#![warn(missing_docs)]

mod config;
pub use self::config::*;

mod real;
pub use self::real::*;
