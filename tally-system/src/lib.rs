//! Foundational system components for Tally's services.
//!
//! Services run as long-lived tasks that receive messages through a bounded inbox. The address of
//! a service, [`Addr`], waits for inbox capacity when sending, which propagates backpressure to
//! producers instead of growing the backlog without limit. Graceful shutdown is coordinated by
//! the [`Controller`], whose [`ShutdownHandle`]s can be awaited inside service loops.
#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
