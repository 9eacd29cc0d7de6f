//! Per-task counters for emissions, write failures, and overruns.
//!
//! Counters are written by exactly one task thread and read by observers
//! (the daemon's status log, tests). Each counter sits on its own cache line
//! so an observer polling one does not disturb the task writing another.

use crate::time::Deadline;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live counters shared between a running task and its observers.
#[derive(Debug, Default)]
pub struct TaskCounters {
    emissions: CachePadded<AtomicU64>,
    write_failures: CachePadded<AtomicU64>,
    overruns: CachePadded<AtomicU64>,
    /// Most recent deadline the task slept towards, as total nanoseconds.
    last_deadline_ns: CachePadded<AtomicI64>,
}

impl TaskCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a successful emission.
    #[inline]
    pub fn record_emission(&self) {
        self.emissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed emission.
    #[inline]
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a deadline that had already passed when the task went to sleep.
    #[inline]
    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember the deadline the task is about to sleep towards.
    #[inline]
    pub fn record_deadline(&self, deadline: Deadline) {
        self.last_deadline_ns
            .store(deadline.as_nanos() as i64, Ordering::Relaxed);
    }

    /// Successful emissions so far.
    #[must_use]
    pub fn emissions(&self) -> u64 {
        self.emissions.load(Ordering::Relaxed)
    }

    /// Failed emissions so far.
    #[must_use]
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Overruns so far.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Plain copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> TaskStats {
        let last = self.last_deadline_ns.load(Ordering::Relaxed);
        TaskStats {
            emissions: self.emissions(),
            write_failures: self.write_failures(),
            overruns: self.overruns(),
            last_deadline: (last != 0)
                .then(|| Deadline::new(0, 0).offset_by(last.max(0) as u64)),
        }
    }
}

/// Point-in-time copy of [`TaskCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStats {
    /// Successful emissions.
    pub emissions: u64,
    /// Failed emissions.
    pub write_failures: u64,
    /// Deadlines already in the past when the task tried to sleep.
    pub overruns: u64,
    /// Last deadline the task slept towards, if any.
    pub last_deadline: Option<Deadline>,
}

impl TaskStats {
    /// Total loop iterations that attempted an emission.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.emissions + self.write_failures
    }

    /// Merge two snapshots (used for whole-wave summaries).
    #[must_use]
    pub fn combine(self, other: TaskStats) -> TaskStats {
        TaskStats {
            emissions: self.emissions + other.emissions,
            write_failures: self.write_failures + other.write_failures,
            overruns: self.overruns + other.overruns,
            last_deadline: self.last_deadline.max(other.last_deadline),
        }
    }
}
