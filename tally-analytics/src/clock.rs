use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::AnalyticsError;

/// Number of seconds in a minute bucket.
const SECONDS_PER_MINUTE: i64 = 60;

/// Source of the current time.
///
/// Production code uses [`SystemClock`]. Tests inject a [`ManualClock`] to move through days and
/// minutes deterministically.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// Returns the current point in time.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock of the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    /// Creates a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Sets the clock to an absolute point in time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        *self.0.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// Maps timestamps to day buckets and minute buckets.
///
/// Day buckets are calendar dates in the service timezone, given as a fixed offset from UTC.
/// Minute buckets are whole minutes since the UNIX epoch and therefore independent of the
/// timezone.
#[derive(Clone, Debug)]
pub struct Calendar {
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
}

impl Calendar {
    /// Creates a calendar for the timezone `utc_offset_secs` east of UTC.
    pub fn new(utc_offset_secs: i32, clock: Arc<dyn Clock>) -> Result<Self, AnalyticsError> {
        let offset = FixedOffset::east_opt(utc_offset_secs)
            .ok_or(AnalyticsError::InvalidTimezone(utc_offset_secs))?;
        Ok(Self { offset, clock })
    }

    /// Returns the clock backing this calendar.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the current point in time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns the current day bucket.
    pub fn today(&self) -> NaiveDate {
        self.date_of(self.now())
    }

    /// Returns the day bucket of a timestamp.
    pub fn date_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.offset).date_naive()
    }

    /// Returns the minute bucket of the current time.
    pub fn now_minute(&self) -> i64 {
        Self::epoch_minute(self.now())
    }

    /// Returns the minute bucket of a timestamp.
    pub fn epoch_minute(timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp().div_euclid(SECONDS_PER_MINUTE)
    }

    /// Returns the day bucket that contains the given minute bucket.
    ///
    /// Returns `None` if the minute is outside of the representable range.
    pub fn date_of_minute(&self, minute: i64) -> Option<NaiveDate> {
        let seconds = minute.checked_mul(SECONDS_PER_MINUTE)?;
        DateTime::from_timestamp(seconds, 0).map(|timestamp| self.date_of(timestamp))
    }
}
