//! Absolute monotonic deadlines and task periods.
//!
//! Deadlines are kept as whole seconds plus a nanosecond remainder in
//! `[0, 1e9)`, mirroring `struct timespec`. All arithmetic is integer-only so
//! that advancing a deadline `N` times by a period `P` lands exactly on
//! `D0 + N * P`; there is no accumulated rounding error however long a task
//! runs.

use crate::error::{WaveError, WaveResult};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// An absolute point on the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Deadline {
    // Field order matters for the derived `Ord`.
    secs: i64,
    nanos: u32,
}

impl Deadline {
    /// Build a deadline, carrying any whole seconds out of `nanos`.
    #[must_use]
    pub fn new(secs: i64, nanos: u64) -> Self {
        Self {
            secs: secs + (nanos / NANOS_PER_SEC) as i64,
            nanos: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    /// Whole seconds.
    #[must_use]
    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Sub-second remainder, always below one second.
    #[must_use]
    pub fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// Total nanoseconds represented by this deadline.
    #[must_use]
    pub fn as_nanos(&self) -> i128 {
        i128::from(self.secs) * i128::from(NANOS_PER_SEC) + i128::from(self.nanos)
    }

    /// Signed nanoseconds from `self` to `later` (negative if `later` is earlier).
    #[must_use]
    pub fn nanos_until(&self, later: Deadline) -> i128 {
        later.as_nanos() - self.as_nanos()
    }

    /// The next deadline one `period` after this one.
    #[must_use]
    pub fn advance(self, period: Period) -> Self {
        self.offset_by(period.as_nanos())
    }

    /// Shift the deadline forward by an arbitrary number of nanoseconds.
    #[must_use]
    pub fn offset_by(self, nanos: u64) -> Self {
        let mut secs = self.secs + (nanos / NANOS_PER_SEC) as i64;
        let mut sub = u64::from(self.nanos) + nanos % NANOS_PER_SEC;
        // Both terms are below 1e9, so at most one carry.
        if sub >= NANOS_PER_SEC {
            sub -= NANOS_PER_SEC;
            secs += 1;
        }
        Self {
            secs,
            nanos: sub as u32,
        }
    }

    /// Shift the deadline forward by a [`Duration`].
    #[must_use]
    pub fn offset_by_duration(self, duration: Duration) -> Self {
        Self {
            secs: self.secs + duration.as_secs() as i64,
            nanos: self.nanos,
        }
        .offset_by(u64::from(duration.subsec_nanos()))
    }

    /// Drop the sub-second part, aligning to the start of the current second.
    #[must_use]
    pub fn truncate_to_second(self) -> Self {
        Self {
            secs: self.secs,
            nanos: 0,
        }
    }

    /// Convert from a kernel `timespec`.
    #[cfg(unix)]
    #[must_use]
    pub fn from_timespec(ts: &libc::timespec) -> Self {
        Self::new(i64::from(ts.tv_sec), ts.tv_nsec.max(0) as u64)
    }

    /// Convert to a kernel `timespec` for `clock_nanosleep`.
    #[cfg(unix)]
    #[must_use]
    pub fn to_timespec(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs as libc::time_t,
            tv_nsec: libc::c_long::from(self.nanos as i32),
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.secs, self.nanos)
    }
}

/// Fixed, non-zero activation period of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period(NonZeroU64);

impl Period {
    /// Create a period from nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero period.
    pub fn from_nanos(nanos: u64) -> WaveResult<Self> {
        NonZeroU64::new(nanos)
            .map(Self)
            .ok_or_else(|| WaveError::Config("period must be greater than zero".into()))
    }

    /// Create a period from a [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero or out-of-range duration.
    pub fn from_duration(duration: Duration) -> WaveResult<Self> {
        let nanos = u64::try_from(duration.as_nanos())
            .map_err(|_| WaveError::Config(format!("period {duration:?} is too long")))?;
        Self::from_nanos(nanos)
    }

    /// Period length in nanoseconds.
    #[must_use]
    pub fn as_nanos(&self) -> u64 {
        self.0.get()
    }

    /// Period as a [`Duration`].
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0.get())
    }

    /// Half the period in nanoseconds, the antiphase offset of a 50% duty cycle.
    #[must_use]
    pub fn half(&self) -> u64 {
        self.0.get() / 2
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.as_duration()))
    }
}

/// Result of sleeping towards an absolute deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The caller blocked until the deadline.
    Slept,
    /// The deadline had already passed; the call returned immediately.
    Overrun,
    /// A stop was requested before the deadline was reached.
    Interrupted,
}

/// Source of absolute monotonic time that can block until a deadline.
///
/// Implemented by the real monotonic clock and by the simulated clock used
/// in tests.
pub trait Clock: Send + Sync {
    /// Current monotonic time.
    fn now(&self) -> Deadline;

    /// Block until `deadline` is reached.
    ///
    /// A deadline that already passed is not an error: the call returns
    /// [`SleepOutcome::Overrun`] without blocking.
    fn sleep_until(&self, deadline: Deadline) -> SleepOutcome;

    /// Block until `deadline` is reached or `stop` becomes set.
    ///
    /// Clocks that can block for long must observe `stop` and return
    /// [`SleepOutcome::Interrupted`] shortly after it is set. The default
    /// suits clocks that never block and ignores the flag.
    fn sleep_until_or_stop(&self, deadline: Deadline, stop: &AtomicBool) -> SleepOutcome {
        let _ = stop;
        self.sleep_until(deadline)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Deadline {
        (**self).now()
    }

    fn sleep_until(&self, deadline: Deadline) -> SleepOutcome {
        (**self).sleep_until(deadline)
    }

    fn sleep_until_or_stop(&self, deadline: Deadline, stop: &AtomicBool) -> SleepOutcome {
        (**self).sleep_until_or_stop(deadline, stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_remainder() {
        let d = Deadline::new(5, 2_500_000_000);
        assert_eq!(d.secs(), 7);
        assert_eq!(d.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn test_no_drift_over_a_million_periods() {
        let period = Period::from_nanos(1_000_000).unwrap();
        let d0 = Deadline::new(1234, 987_654_321);
        let mut d = d0;

        for n in 1..=1_000_000u64 {
            d = d.advance(period);
            assert!(u64::from(d.subsec_nanos()) < NANOS_PER_SEC);
            if n % 100_000 == 0 {
                assert_eq!(d.as_nanos(), d0.as_nanos() + i128::from(n) * 1_000_000);
            }
        }

        assert_eq!(d.as_nanos(), d0.as_nanos() + 1_000_000_000_000);
        assert_eq!(d.secs(), 2234);
        assert_eq!(d.subsec_nanos(), 987_654_321);
    }

    #[test]
    fn test_advance_normalizes_for_any_remainder() {
        let period = Period::from_nanos(999_999_999).unwrap();
        for raw in (0..2 * NANOS_PER_SEC).step_by(7_777_777) {
            let d = Deadline::new(10, raw).advance(period);
            assert!(u64::from(d.subsec_nanos()) < NANOS_PER_SEC, "raw={raw}");
            assert_eq!(
                d.as_nanos(),
                10 * i128::from(NANOS_PER_SEC) + i128::from(raw) + 999_999_999
            );
        }
    }

    #[test]
    fn test_offset_by_multiple_seconds() {
        let d = Deadline::new(1, 900_000_000).offset_by(2_200_000_000);
        assert_eq!(d, Deadline::new(4, 100_000_000));

        let d = Deadline::new(1, 0).offset_by_duration(Duration::from_millis(2500));
        assert_eq!(d, Deadline::new(3, 500_000_000));
    }

    #[test]
    fn test_phase_offset_is_preserved() {
        let period = Period::from_nanos(1_000_000).unwrap();
        let mut a = Deadline::new(100, 999_800_000);
        let mut b = a.offset_by(period.half());

        for _ in 0..10_000 {
            assert_eq!(a.nanos_until(b), 500_000);
            a = a.advance(period);
            b = b.advance(period);
        }
    }

    #[test]
    fn test_ordering_and_truncate() {
        let early = Deadline::new(3, 999_999_999);
        let late = Deadline::new(4, 0);
        assert!(early < late);
        assert_eq!(early.nanos_until(late), 1);
        assert_eq!(late.nanos_until(early), -1);
        assert_eq!(early.truncate_to_second(), Deadline::new(3, 0));
    }

    #[test]
    fn test_timespec_conversion() {
        let d = Deadline::new(42, 123_456_789);
        let ts = d.to_timespec();
        assert_eq!(ts.tv_sec, 42);
        assert_eq!(ts.tv_nsec, 123_456_789);
        assert_eq!(Deadline::from_timespec(&ts), d);
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(Period::from_nanos(0).is_err());
        assert!(Period::from_duration(Duration::ZERO).is_err());

        let p = Period::from_duration(Duration::from_millis(1)).unwrap();
        assert_eq!(p.as_nanos(), 1_000_000);
        assert_eq!(p.half(), 500_000);
        assert_eq!(p.to_string(), "1ms");
    }

    #[test]
    fn test_display() {
        assert_eq!(Deadline::new(2, 5).to_string(), "2.000000005s");
    }
}
