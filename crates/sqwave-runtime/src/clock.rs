//! Deadline clocks.
//!
//! [`MonotonicClock`] reads `CLOCK_MONOTONIC` and sleeps with
//! `clock_nanosleep(TIMER_ABSTIME)`, so every wake-up targets an absolute
//! instant derived from the task's original start time. A late wake-up in one
//! period therefore never shifts the following ones.
//!
//! [`SimulatedClock`] keeps virtual time for tests: sleepers block until a
//! test harness advances the clock past their deadline.
//!
//! Both clocks notice a stop request within [`STOP_POLL_INTERVAL`] while
//! sleeping, so a long start delay never holds up shutdown.

use sqwave_common::{Clock, Deadline, SleepOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{trace, warn};

/// Longest a sleeper goes without checking its stop flag.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// The system monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Create a handle to the monotonic clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    /// # Panics
    ///
    /// Panics if `CLOCK_MONOTONIC` cannot be read. The monotonic clock is
    /// assumed to always exist; without it no deadline can be computed.
    fn now(&self) -> Deadline {
        use nix::time::{clock_gettime, ClockId};

        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .unwrap_or_else(|e| panic!("CLOCK_MONOTONIC is unavailable: {e}"));
        Deadline::new(ts.tv_sec() as i64, ts.tv_nsec().max(0) as u64)
    }

    #[cfg(target_os = "linux")]
    fn sleep_until(&self, deadline: Deadline) -> SleepOutcome {
        if deadline <= self.now() {
            return SleepOutcome::Overrun;
        }

        let ts = deadline.to_timespec();
        loop {
            // SAFETY: `ts` is a valid timespec and the remainder pointer may be
            // null for absolute sleeps.
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            match rc {
                0 => return SleepOutcome::Slept,
                // Interrupted: sleep again towards the same absolute instant.
                libc::EINTR => trace!("clock_nanosleep interrupted, resuming"),
                err => {
                    warn!(
                        error = %std::io::Error::from_raw_os_error(err),
                        "clock_nanosleep failed, falling back to relative sleep"
                    );
                    sleep_relative(self, deadline);
                    return SleepOutcome::Slept;
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sleep_until(&self, deadline: Deadline) -> SleepOutcome {
        if deadline <= self.now() {
            return SleepOutcome::Overrun;
        }
        sleep_relative(self, deadline);
        SleepOutcome::Slept
    }

    fn sleep_until_or_stop(&self, deadline: Deadline, stop: &AtomicBool) -> SleepOutcome {
        if deadline <= self.now() {
            return SleepOutcome::Overrun;
        }

        // Every slice ends on an absolute instant and the last one ends on
        // `deadline` itself, so slicing adds no drift.
        loop {
            if stop.load(Ordering::Acquire) {
                return SleepOutcome::Interrupted;
            }
            let slice_end = self
                .now()
                .offset_by_duration(STOP_POLL_INTERVAL)
                .min(deadline);
            self.sleep_until(slice_end);
            if slice_end == deadline {
                return SleepOutcome::Slept;
            }
        }
    }
}

fn sleep_relative(clock: &MonotonicClock, deadline: Deadline) {
    let remaining = clock.now().nanos_until(deadline);
    if remaining > 0 {
        std::thread::sleep(Duration::from_nanos(
            u64::try_from(remaining).unwrap_or(u64::MAX),
        ));
    }
}

#[derive(Debug)]
struct VirtualTime {
    now: Deadline,
    sleepers: Vec<Deadline>,
}

/// Virtual monotonic clock driven by a test harness.
///
/// `sleep_until` registers the deadline and blocks until the harness moves
/// virtual time to or past it. Because a woken sleeper is removed by the
/// thread that advanced time, [`wait_for_sleepers`](Self::wait_for_sleepers)
/// only counts threads that are actually blocked again, which lets a harness
/// step several tasks one event at a time.
#[derive(Debug)]
pub struct SimulatedClock {
    time: Mutex<VirtualTime>,
    changed: Condvar,
}

impl SimulatedClock {
    /// Create a clock reading `start`.
    pub fn new(start: Deadline) -> Self {
        Self {
            time: Mutex::new(VirtualTime {
                now: start,
                sleepers: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualTime> {
        self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move virtual time to `target` (never backwards) and wake due sleepers.
    pub fn advance_to(&self, target: Deadline) {
        let mut time = self.lock();
        if target > time.now {
            time.now = target;
        }
        let now = time.now;
        time.sleepers.retain(|d| *d > now);
        self.changed.notify_all();
    }

    /// Move virtual time forward by `nanos`.
    pub fn advance_by(&self, nanos: u64) {
        let target = self.now().offset_by(nanos);
        self.advance_to(target);
    }

    /// Jump to the earliest pending deadline and wake its sleeper(s).
    ///
    /// Returns the new time, or `None` if nobody is sleeping.
    pub fn advance_to_next_deadline(&self) -> Option<Deadline> {
        let mut time = self.lock();
        let next = time.sleepers.iter().min().copied()?;
        if next > time.now {
            time.now = next;
        }
        let now = time.now;
        time.sleepers.retain(|d| *d > now);
        self.changed.notify_all();
        Some(now)
    }

    /// Number of threads currently blocked in `sleep_until`.
    pub fn sleepers(&self) -> usize {
        self.lock().sleepers.len()
    }

    /// Block until at least `count` threads are sleeping or `timeout` expires.
    ///
    /// Returns `true` if the count was reached.
    pub fn wait_for_sleepers(&self, count: usize, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |t| t.sleepers.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.sleepers.len() >= count
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Deadline {
        self.lock().now
    }

    fn sleep_until(&self, deadline: Deadline) -> SleepOutcome {
        let mut time = self.lock();
        if deadline <= time.now {
            return SleepOutcome::Overrun;
        }

        time.sleepers.push(deadline);
        self.changed.notify_all();
        while time.now < deadline {
            time = self
                .changed
                .wait(time)
                .unwrap_or_else(PoisonError::into_inner);
        }
        SleepOutcome::Slept
    }

    fn sleep_until_or_stop(&self, deadline: Deadline, stop: &AtomicBool) -> SleepOutcome {
        let mut time = self.lock();
        if deadline <= time.now {
            return SleepOutcome::Overrun;
        }

        time.sleepers.push(deadline);
        self.changed.notify_all();
        while time.now < deadline {
            if stop.load(Ordering::Acquire) {
                // Still registered: only the advancer removes due sleepers.
                if let Some(i) = time.sleepers.iter().position(|d| *d == deadline) {
                    time.sleepers.swap_remove(i);
                }
                self.changed.notify_all();
                return SleepOutcome::Interrupted;
            }
            time = self
                .changed
                .wait_timeout(time, STOP_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        SleepOutcome::Slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_monotonic_now_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(u64::from(a.subsec_nanos()) < sqwave_common::NANOS_PER_SEC);
    }

    #[test]
    fn test_past_deadline_returns_immediately() {
        let clock = MonotonicClock::new();
        let past = Deadline::new(clock.now().secs() - 1, 0);

        let start = Instant::now();
        assert_eq!(clock.sleep_until(past), SleepOutcome::Overrun);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn test_sleep_until_absolute_deadline() {
        let clock = MonotonicClock::new();
        let deadline = clock.now().offset_by(5_000_000);

        assert_eq!(clock.sleep_until(deadline), SleepOutcome::Slept);
        assert!(clock.now() >= deadline);
    }

    #[test]
    fn test_monotonic_sleep_ends_early_on_stop() {
        let clock = MonotonicClock::new();
        let stop = Arc::new(AtomicBool::new(false));
        let setter = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                stop.store(true, Ordering::Release);
            })
        };

        let start = Instant::now();
        let deadline = clock.now().offset_by(5_000_000_000);
        assert_eq!(
            clock.sleep_until_or_stop(deadline, &stop),
            SleepOutcome::Interrupted
        );
        assert!(start.elapsed() < Duration::from_millis(500));
        setter.join().unwrap();
    }

    #[test]
    fn test_monotonic_sliced_sleep_reaches_deadline() {
        let clock = MonotonicClock::new();
        let stop = AtomicBool::new(false);
        let deadline = clock.now().offset_by(12_000_000);

        assert_eq!(clock.sleep_until_or_stop(deadline, &stop), SleepOutcome::Slept);
        assert!(clock.now() >= deadline);
    }

    #[test]
    fn test_simulated_past_deadline_is_overrun() {
        let clock = SimulatedClock::new(Deadline::new(10, 0));
        let start = Instant::now();
        assert_eq!(
            clock.sleep_until(Deadline::new(9, 999_999_999)),
            SleepOutcome::Overrun
        );
        assert_eq!(clock.sleep_until(Deadline::new(10, 0)), SleepOutcome::Overrun);
        assert!(start.elapsed() < Duration::from_millis(1));
        assert_eq!(clock.sleepers(), 0);
    }

    #[test]
    fn test_simulated_sleeper_wakes_on_advance() {
        let clock = Arc::new(SimulatedClock::new(Deadline::new(0, 0)));
        let sleeper = {
            let clock = Arc::clone(&clock);
            std::thread::spawn(move || clock.sleep_until(Deadline::new(0, 500)))
        };

        assert!(clock.wait_for_sleepers(1, Duration::from_secs(5)));
        clock.advance_by(499);
        assert_eq!(clock.sleepers(), 1);

        assert_eq!(clock.advance_to_next_deadline(), Some(Deadline::new(0, 500)));
        assert_eq!(sleeper.join().unwrap(), SleepOutcome::Slept);
        assert_eq!(clock.sleepers(), 0);
        assert_eq!(clock.advance_to_next_deadline(), None);
    }

    #[test]
    fn test_simulated_sleeper_leaves_on_stop() {
        let clock = Arc::new(SimulatedClock::new(Deadline::new(0, 0)));
        let stop = Arc::new(AtomicBool::new(false));
        let sleeper = {
            let clock = Arc::clone(&clock);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || clock.sleep_until_or_stop(Deadline::new(3, 0), &stop))
        };

        assert!(clock.wait_for_sleepers(1, Duration::from_secs(5)));
        stop.store(true, Ordering::Release);
        assert_eq!(sleeper.join().unwrap(), SleepOutcome::Interrupted);

        // Virtual time did not move and the sleeper unregistered itself.
        assert_eq!(clock.now(), Deadline::new(0, 0));
        assert_eq!(clock.sleepers(), 0);
    }

    #[test]
    fn test_simulated_time_never_goes_backwards() {
        let clock = SimulatedClock::new(Deadline::new(5, 0));
        clock.advance_to(Deadline::new(4, 0));
        assert_eq!(clock.now(), Deadline::new(5, 0));
    }
}
