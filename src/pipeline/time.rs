//! Logical timestamps for the pipeline.
//!
//! `Time` is a signed count of nanoseconds since the Unix epoch. It is used for
//! both originating times (when the real-world event happened) and creation
//! times (when the message was produced), and as the key of the scheduler heap.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// A logical pipeline timestamp (nanoseconds since the Unix epoch).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Time(i64);

impl Time {
    /// Earliest representable time. Used as the key of lifecycle work.
    pub const MIN: Time = Time(i64::MIN);
    /// Latest representable time.
    pub const MAX: Time = Time(i64::MAX);
    /// 1970-01-01T00:00:00Z.
    pub const EPOCH: Time = Time(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros.saturating_mul(NANOS_PER_MICRO))
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(NANOS_PER_MILLI))
    }

    #[inline]
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0.div_euclid(NANOS_PER_MILLI)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from a UTC datetime, saturating outside the representable range.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        match dt.timestamp_nanos_opt() {
            Some(nanos) => Self(nanos),
            None if dt.timestamp() < 0 => Self::MIN,
            None => Self::MAX,
        }
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    pub fn saturating_add(self, delta: Duration) -> Self {
        Self(self.0.saturating_add(duration_to_nanos(delta)))
    }

    pub fn saturating_sub(self, delta: Duration) -> Self {
        Self(self.0.saturating_sub(duration_to_nanos(delta)))
    }

    /// Elapsed time from `earlier` to `self`, or `None` if `earlier` is later.
    pub fn duration_since(self, earlier: Time) -> Option<Duration> {
        self.0
            .checked_sub(earlier.0)
            .filter(|nanos| *nanos >= 0)
            .map(|nanos| Duration::from_nanos(nanos as u64))
    }

    pub fn saturating_duration_since(self, earlier: Time) -> Duration {
        self.duration_since(earlier).unwrap_or(Duration::ZERO)
    }
}

fn duration_to_nanos(delta: Duration) -> i64 {
    i64::try_from(delta.as_nanos()).unwrap_or(i64::MAX)
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        self.saturating_add(rhs)
    }
}

impl Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, rhs: Duration) -> Time {
        self.saturating_sub(rhs)
    }
}

impl From<DateTime<Utc>> for Time {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Time::MIN => write!(f, "Time(MIN)"),
            Time::MAX => write!(f, "Time(MAX)"),
            Time(nanos) => write!(f, "Time({nanos})"),
        }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Time::MIN => write!(f, "-inf"),
            Time::MAX => write!(f, "+inf"),
            t => write!(
                f,
                "{}",
                t.to_datetime().to_rfc3339_opts(SecondsFormat::Nanos, true)
            ),
        }
    }
}
