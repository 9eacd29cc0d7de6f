//! In-memory output line for running without hardware.
//!
//! Records every emitted level, optionally stamped with the time read from a
//! [`Clock`], and can inject write failures on chosen calls.

use crate::OutputSink;
use sqwave_common::{Clock, Deadline, Level, WaveError, WaveResult};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// One recorded emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    /// Clock reading at the time of the write, if the sink has a clock.
    pub at: Option<Deadline>,
    /// Level written.
    pub level: Level,
}

#[derive(Debug, Default)]
struct LineState {
    open: bool,
    level: Level,
    emissions: Vec<Emission>,
    calls: u64,
    fail_calls: BTreeSet<u64>,
    fail_next: u64,
    close_count: u32,
}

/// Simulated output line.
pub struct SimulatedSink {
    state: Mutex<LineState>,
    clock: Option<Arc<dyn Clock>>,
}

impl std::fmt::Debug for SimulatedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSink")
            .field("state", &self.state)
            .field("has_clock", &self.clock.is_some())
            .finish()
    }
}

impl Default for SimulatedSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSink {
    /// Create an open line without timestamps.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LineState {
                open: true,
                ..Default::default()
            }),
            clock: None,
        }
    }

    /// Create an open line that stamps each emission with `clock.now()`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: Some(clock),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        // A panicking writer leaves only plain data behind.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fail the next `count` calls to `set`.
    pub fn fail_next(&self, count: u64) {
        self.lock().fail_next = count;
    }

    /// Fail the `call`-th call to `set` (1-based, counted from creation).
    pub fn fail_on_call(&self, call: u64) {
        self.lock().fail_calls.insert(call);
    }

    /// All successful emissions in order.
    pub fn emissions(&self) -> Vec<Emission> {
        self.lock().emissions.clone()
    }

    /// Levels of all successful emissions in order.
    pub fn levels(&self) -> Vec<Level> {
        self.lock().emissions.iter().map(|e| e.level).collect()
    }

    /// Current level of the line.
    pub fn level(&self) -> Level {
        self.lock().level
    }

    /// Number of `set` calls, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> u32 {
        self.lock().close_count
    }
}

impl OutputSink for SimulatedSink {
    fn set(&self, value: Level) -> WaveResult<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(WaveError::Closed);
        }

        state.calls += 1;
        let call = state.calls;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(WaveError::Io(format!("injected write failure on call {call}")));
        }
        if state.fail_calls.remove(&call) {
            return Err(WaveError::Io(format!("injected write failure on call {call}")));
        }

        state.level = value;
        let at = self.clock.as_ref().map(|c| c.now());
        state.emissions.push(Emission { at, level: value });
        Ok(())
    }

    fn close(&self) -> WaveResult<()> {
        let mut state = self.lock();
        state.open = false;
        state.close_count += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}
