//! Configuration for the Tally analytics service.
//!
//! The configuration is read from `config.yml` inside a configuration directory. All sections are
//! optional and fall back to their defaults. Individual values can be overridden from the command
//! line or the environment through [`OverridableConfig`].
//!
//! ```yaml
//! logging:
//!   level: info
//! metrics:
//!   statsd: 127.0.0.1:8125
//! redis: redis://127.0.0.1:6379
//! analytics:
//!   utc_offset_secs: 28800
//! ```
#![warn(missing_docs)]

mod config;

pub use self::config::*;
