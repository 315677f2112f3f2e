//! Microsecond-resolution time types used by the timer queues.
//!
//! The kernel multiplexers take millisecond timeouts while `timerfd` is
//! armed in nanoseconds; a single microsecond representation sits in the
//! middle and converts losslessly enough for both. All arithmetic is
//! saturating so a `Duration::MAX` deadline behaves like "never".

use std::fmt;
use std::mem::MaybeUninit;
use std::ops;

/// A signed span of time in microseconds.
///
/// A zero duration means "immediate". Negative durations can fall out of
/// timestamp subtraction and are accepted by the arithmetic below; the
/// timer channel clamps them before arming the kernel timer.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Duration(i64);

pub(crate) const MICROS_PER_SEC: i64 = 1_000_000;
pub(crate) const MICROS_PER_MILLI: i64 = 1_000;
pub(crate) const NANOS_PER_MICRO: i64 = 1_000;

impl Duration {
    /// The zero-length duration.
    pub const ZERO: Duration = Duration(0);

    /// The longest representable duration, used as an "infinitely far
    /// away" sentinel by the timer channel.
    pub const MAX: Duration = Duration(i64::MAX);

    /// Creates a duration from a count of microseconds.
    pub const fn from_micros(micros: i64) -> Duration {
        Duration(micros)
    }

    /// Creates a duration from a count of milliseconds.
    pub const fn from_millis(millis: i64) -> Duration {
        Duration(millis.saturating_mul(MICROS_PER_MILLI))
    }

    /// Creates a duration from a count of seconds.
    pub const fn from_secs(secs: i64) -> Duration {
        Duration(secs.saturating_mul(MICROS_PER_SEC))
    }

    /// Returns the number of whole microseconds.
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns the number of whole milliseconds, truncating.
    pub const fn as_millis(self) -> i64 {
        self.0 / MICROS_PER_MILLI
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts to a `std::time::Duration`, returning `None` for
    /// negative values.
    pub fn to_std(self) -> Option<std::time::Duration> {
        if self.0 < 0 {
            return None;
        }
        Some(std::time::Duration::from_micros(self.0 as u64))
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Duration {
        let micros = d.as_micros();
        if micros > i64::MAX as u128 {
            Duration::MAX
        } else {
            Duration(micros as i64)
        }
    }
}

impl ops::Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Duration;

    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0.saturating_mul(rhs))
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// An instant on the monotonic clock, in unsigned microseconds since an
/// unspecified epoch.
///
/// Only differences between timestamps and offsets by [`Duration`] are
/// meaningful; the epoch is whatever `CLOCK_MONOTONIC` counts from.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Reads the monotonic clock.
    pub fn now() -> Timestamp {
        let mut ts = MaybeUninit::<libc::timespec>::uninit();
        // The monotonic clock is always available on the supported
        // targets, so the syscall cannot fail with a valid pointer.
        syscall!(clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()))
            .expect("clock_gettime(CLOCK_MONOTONIC) failed");
        let ts = unsafe { ts.assume_init() };
        let micros =
            ts.tv_sec as u64 * MICROS_PER_SEC as u64 + ts.tv_nsec as u64 / NANOS_PER_MICRO as u64;
        Timestamp(micros)
    }

    /// Returns the raw microsecond count.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub(crate) const fn from_micros(micros: u64) -> Timestamp {
        Timestamp(micros)
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        if rhs.0 >= 0 {
            Timestamp(self.0.saturating_add(rhs.0 as u64))
        } else {
            Timestamp(self.0.saturating_sub(rhs.0.unsigned_abs()))
        }
    }
}

impl ops::Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        self + Duration(-rhs.0)
    }
}

impl ops::Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        if self.0 >= rhs.0 {
            Duration((self.0 - rhs.0).min(i64::MAX as u64) as i64)
        } else {
            Duration(-((rhs.0 - self.0).min(i64::MAX as u64) as i64))
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}us)", self.0)
    }
}
