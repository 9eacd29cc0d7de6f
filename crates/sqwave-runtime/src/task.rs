//! Periodic task: emit a fixed level on absolute, drift-free deadlines.
//!
//! Each task owns its descriptor and state machine. The loop is:
//! 1. Sleep until the first deadline (start grace period)
//! 2. Check the cooperative stop token
//! 3. Emit the task's level to the output sink
//! 4. Advance the deadline by exactly one period
//! 5. Sleep until the new absolute deadline, then repeat from 2
//!
//! Sleeps end early when the stop token is set, so a stop never waits for
//! the next deadline.
//!
//! Write failures and overruns are counted, never propagated: a glitch on
//! the line must not stop the wave.

use sqwave_common::{
    Clock, Deadline, Level, Period, SleepOutcome, TaskCounters, TaskState, TaskStateMachine,
    TaskStats,
};
use sqwave_gpio::OutputSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Everything a task needs to know about its schedule.
///
/// Built once per task and moved into the task's thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Task name, used for the thread name and log fields.
    pub name: String,
    /// Next absolute activation time.
    pub deadline: Deadline,
    /// Activation period.
    pub period: Period,
    /// Level emitted on every activation.
    pub value: Level,
}

/// Cooperative stop request shared by all tasks of a wave.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every task holding this token to exit at its next iteration.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

/// Summary returned by a task when its loop exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Task name.
    pub name: String,
    /// Completed loop iterations (emission attempts).
    pub iterations: u64,
    /// Final counter values.
    pub stats: TaskStats,
    /// State the task ended in.
    pub final_state: TaskState,
}

/// A task that drives one output level once per period.
pub struct PeriodicTask<C: Clock, S: OutputSink> {
    descriptor: TaskDescriptor,
    clock: C,
    sink: S,
    stop: StopToken,
    counters: Arc<TaskCounters>,
    state: TaskStateMachine,
    iterations: u64,
    status_interval: u64,
    failing: bool,
}

impl<C: Clock, S: OutputSink> PeriodicTask<C, S> {
    /// Create a task in the `CREATED` state.
    pub fn new(
        descriptor: TaskDescriptor,
        clock: C,
        sink: S,
        stop: StopToken,
        counters: Arc<TaskCounters>,
    ) -> Self {
        Self {
            descriptor,
            clock,
            sink,
            stop,
            counters,
            state: TaskStateMachine::new(),
            iterations: 0,
            status_interval: 0,
            failing: false,
        }
    }

    /// Log counters every `interval` iterations (0 disables).
    #[must_use]
    pub fn with_status_interval(mut self, interval: u64) -> Self {
        self.status_interval = interval;
        self
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state.state()
    }

    /// Deadline the task will wake at next.
    pub fn deadline(&self) -> Deadline {
        self.descriptor.deadline
    }

    /// Completed iterations.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    fn enter(&mut self, target: TaskState) {
        // Transitions are driven only by this loop, so a rejection is a bug
        // worth logging but never worth stopping the wave for.
        if let Err(e) = self.state.transition(target) {
            error!(task = %self.descriptor.name, error = %e, "Task state machine rejected transition");
        }
    }

    fn sleep(&mut self) -> SleepOutcome {
        let deadline = self.descriptor.deadline;
        self.counters.record_deadline(deadline);
        let outcome = self.clock.sleep_until_or_stop(deadline, self.stop.flag());
        match outcome {
            SleepOutcome::Overrun => {
                self.counters.record_overrun();
                debug!(task = %self.descriptor.name, %deadline, "Deadline already passed");
            }
            SleepOutcome::Interrupted => {
                debug!(task = %self.descriptor.name, %deadline, "Sleep cut short by stop request");
            }
            SleepOutcome::Slept => {}
        }
        outcome
    }

    /// Move from `CREATED` to `SLEEPING` and wait for the first deadline.
    pub fn begin(&mut self) -> SleepOutcome {
        self.enter(TaskState::Running);
        info!(
            task = %self.descriptor.name,
            first_deadline = %self.descriptor.deadline,
            period = %self.descriptor.period,
            value = %self.descriptor.value,
            "Task started"
        );
        self.enter(TaskState::Sleeping);
        self.sleep()
    }

    /// Run one iteration: emit, advance the deadline, sleep until it.
    pub fn step(&mut self) -> SleepOutcome {
        self.enter(TaskState::Executing);
        self.emit();
        self.iterations += 1;

        self.descriptor.deadline = self.descriptor.deadline.advance(self.descriptor.period);

        if self.status_interval > 0 && self.iterations % self.status_interval == 0 {
            let stats = self.counters.snapshot();
            info!(
                task = %self.descriptor.name,
                iterations = self.iterations,
                emissions = stats.emissions,
                write_failures = stats.write_failures,
                overruns = stats.overruns,
                "Task status"
            );
        }

        self.enter(TaskState::Sleeping);
        self.sleep()
    }

    fn emit(&mut self) {
        match self.sink.set(self.descriptor.value) {
            Ok(()) => {
                self.counters.record_emission();
                if self.failing {
                    self.failing = false;
                    info!(
                        task = %self.descriptor.name,
                        iteration = self.iterations,
                        "Output writes recovered"
                    );
                }
                trace!(task = %self.descriptor.name, value = %self.descriptor.value, "Emitted");
            }
            Err(e) => {
                self.counters.record_write_failure();
                if !self.failing {
                    self.failing = true;
                    warn!(
                        task = %self.descriptor.name,
                        iteration = self.iterations,
                        error = %e,
                        "Output write failed, continuing"
                    );
                } else {
                    debug!(task = %self.descriptor.name, error = %e, "Output write failed again");
                }
            }
        }
    }

    /// Run until the stop token is set.
    ///
    /// This blocks the current thread. The token is checked after each
    /// wake-up, and a pending sleep returns early once it is set.
    pub fn run(mut self) -> TaskReport {
        if self.state.state() == TaskState::Created {
            self.begin();
        }

        while !self.stop.is_stop_requested() {
            self.step();
        }

        self.enter(TaskState::Stopped);
        let stats = self.counters.snapshot();
        info!(
            task = %self.descriptor.name,
            iterations = self.iterations,
            emissions = stats.emissions,
            write_failures = stats.write_failures,
            overruns = stats.overruns,
            "Task stopped"
        );

        TaskReport {
            name: self.descriptor.name,
            iterations: self.iterations,
            stats,
            final_state: self.state.state(),
        }
    }
}
