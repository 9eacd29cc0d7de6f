//! Shared harness for stepping a wave on simulated time.

#![allow(dead_code)] // Not every scenario uses every helper

use sqwave_common::{Deadline, Period};
use sqwave_gpio::SimulatedSink;
use sqwave_runtime::{
    square_wave_phases, Orchestrator, OrchestratorConfig, PhaseTask, SimulatedClock, TaskReport,
    WaveHandle,
};
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for task threads to block again before failing a test.
pub const SLEEPER_TIMEOUT: Duration = Duration::from_secs(5);

/// A 1 ms period.
pub fn period_1ms() -> Period {
    Period::from_nanos(1_000_000).unwrap()
}

/// Running wave on a simulated clock with a timestamping sink.
pub struct SimulatedRig {
    pub clock: Arc<SimulatedClock>,
    pub sink: Arc<SimulatedSink>,
    pub handle: WaveHandle,
    tasks: usize,
}

impl SimulatedRig {
    /// Launch the canonical two-task wave.
    pub fn launch(start: Deadline, config: OrchestratorConfig) -> Self {
        let phases = square_wave_phases(config.period);
        Self::launch_phases(start, config, &phases)
    }

    /// Launch an arbitrary phase list.
    pub fn launch_phases(start: Deadline, config: OrchestratorConfig, phases: &[PhaseTask]) -> Self {
        let clock = Arc::new(SimulatedClock::new(start));
        let sink = Arc::new(SimulatedSink::with_clock(clock.clone()));
        let orchestrator = Orchestrator::new(Arc::clone(&clock), Arc::clone(&sink), config);
        let handle = orchestrator.launch(phases).unwrap();
        Self {
            clock,
            sink,
            handle,
            tasks: phases.len(),
        }
    }

    /// Wait until every task is blocked on its next deadline.
    pub fn settle(&self) {
        assert!(
            self.clock.wait_for_sleepers(self.tasks, SLEEPER_TIMEOUT),
            "tasks did not go back to sleep"
        );
    }

    /// Release the earliest pending deadline `events` times.
    pub fn step(&self, events: usize) {
        for _ in 0..events {
            self.settle();
            self.clock.advance_to_next_deadline().unwrap();
        }
        self.settle();
    }

    /// Stop the wave and keep time moving until every task has exited.
    pub fn finish(self) -> Vec<TaskReport> {
        self.handle.stop();
        while !self.handle.is_finished() {
            if self.clock.advance_to_next_deadline().is_none() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.handle.join().unwrap()
    }
}
