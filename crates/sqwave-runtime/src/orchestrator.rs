//! Task orchestrator: derives phase-locked start deadlines and spawns one
//! real-time thread per phase.
//!
//! All tasks share a single base deadline computed once at launch. Task `i`
//! first wakes at `base + phase_offset_i` and then advances by the common
//! period, so the relative phase between tasks is fixed forever.

use crate::realtime::{prepare_task_thread, ThreadSetup, ThreadStatus};
use crate::task::{PeriodicTask, StopToken, TaskDescriptor, TaskReport};
use sqwave_common::config::{CpuAffinity, SchedAttrs, WaveConfig};
use sqwave_common::{Clock, Deadline, Level, Period, TaskCounters, TaskStats, WaveError, WaveResult};
use sqwave_gpio::OutputSink;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// One task of the wave: which level to drive and when within the period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTask {
    /// Task name.
    pub name: String,
    /// Level emitted by the task.
    pub value: Level,
    /// Offset of the task's first deadline from the shared base.
    pub phase_offset_ns: u64,
}

impl PhaseTask {
    /// Create a phase entry.
    pub fn new(name: impl Into<String>, value: Level, phase_offset_ns: u64) -> Self {
        Self {
            name: name.into(),
            value,
            phase_offset_ns,
        }
    }
}

/// The 50% duty-cycle pair: `high` at the base, `low` half a period later.
pub fn square_wave_phases(period: Period) -> Vec<PhaseTask> {
    vec![
        PhaseTask::new("high", Level::High, 0),
        PhaseTask::new("low", Level::Low, period.half()),
    ]
}

/// Launch parameters shared by every task of a wave.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Common task period.
    pub period: Period,
    /// Grace period between launch and the base deadline.
    pub start_delay: Duration,
    /// Truncate the launch time to a whole second before adding the delay.
    pub align_to_second: bool,
    /// Scheduling attributes each task thread applies to itself.
    pub sched: Option<SchedAttrs>,
    /// CPU pinning for the task threads.
    pub cpu_affinity: CpuAffinity,
    /// Treat missing RT privileges as fatal.
    pub fail_fast: bool,
    /// Per-task status log interval in iterations (0 disables).
    pub status_interval: u64,
}

impl OrchestratorConfig {
    /// Unprivileged configuration: no delay, no alignment, default scheduling.
    pub fn new(period: Period) -> Self {
        Self {
            period,
            start_delay: Duration::ZERO,
            align_to_second: false,
            sched: None,
            cpu_affinity: CpuAffinity::None,
            fail_fast: false,
            status_interval: 0,
        }
    }

    /// Derive launch parameters from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid period.
    pub fn from_wave_config(config: &WaveConfig) -> WaveResult<Self> {
        let setup = ThreadSetup::from_config(&config.realtime);
        Ok(Self {
            period: config.period()?,
            start_delay: config.start_delay,
            align_to_second: config.align_to_second,
            sched: setup.sched,
            cpu_affinity: setup.cpu_affinity,
            fail_fast: setup.fail_fast,
            status_interval: config.status_interval,
        })
    }

    fn thread_setup(&self) -> ThreadSetup {
        ThreadSetup {
            sched: self.sched,
            cpu_affinity: self.cpu_affinity.clone(),
            fail_fast: self.fail_fast,
        }
    }
}

/// Spawns and supervises the periodic tasks of one wave.
pub struct Orchestrator<C, S> {
    clock: C,
    sink: S,
    config: OrchestratorConfig,
}

impl<C, S> Orchestrator<C, S>
where
    C: Clock + Clone + 'static,
    S: OutputSink + Clone + 'static,
{
    /// Create an orchestrator driving `sink` on `clock`.
    pub fn new(clock: C, sink: S, config: OrchestratorConfig) -> Self {
        Self {
            clock,
            sink,
            config,
        }
    }

    /// Base deadline for a launch happening now.
    pub fn base_deadline(&self) -> Deadline {
        let now = self.clock.now();
        let anchor = if self.config.align_to_second {
            now.truncate_to_second()
        } else {
            now
        };
        anchor.offset_by_duration(self.config.start_delay)
    }

    /// First deadline of each phase relative to `base`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty phase list or a phase
    /// offset that is not shorter than the period.
    pub fn initial_deadlines(&self, base: Deadline, phases: &[PhaseTask]) -> WaveResult<Vec<Deadline>> {
        if phases.is_empty() {
            return Err(WaveError::Config("no tasks to launch".into()));
        }
        phases
            .iter()
            .map(|phase| {
                if phase.phase_offset_ns >= self.config.period.as_nanos() {
                    return Err(WaveError::Config(format!(
                        "phase offset {}ns of task {} is not shorter than the period {}",
                        phase.phase_offset_ns, phase.name, self.config.period
                    )));
                }
                Ok(base.offset_by(phase.phase_offset_ns))
            })
            .collect()
    }

    /// Spawn one thread per phase and return a handle to the running wave.
    ///
    /// Each thread applies the scheduling attributes to itself and reports
    /// back before entering its loop. If any spawn or setup fails, the
    /// already-started tasks are stopped and joined before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`WaveError::Config`] for an invalid phase list,
    /// [`WaveError::Spawn`] if a thread cannot be created, or the setup error
    /// reported by a task thread.
    pub fn launch(&self, phases: &[PhaseTask]) -> WaveResult<WaveHandle> {
        let base = self.base_deadline();
        let deadlines = self.initial_deadlines(base, phases)?;
        let stop = StopToken::new();
        let mut handle = WaveHandle {
            stop: stop.clone(),
            tasks: Vec::with_capacity(phases.len()),
        };

        info!(
            base = %base,
            period = %self.config.period,
            tasks = phases.len(),
            "Launching periodic tasks"
        );

        for (phase, deadline) in phases.iter().zip(deadlines) {
            let descriptor = TaskDescriptor {
                name: phase.name.clone(),
                deadline,
                period: self.config.period,
                value: phase.value,
            };
            if let Err(e) = self.spawn_task(descriptor, &stop, &mut handle) {
                error!(task = %phase.name, error = %e, "Task launch failed, stopping started tasks");
                handle.stop();
                if let Err(join_err) = handle.join() {
                    error!(error = %join_err, "Failed to join task during launch rollback");
                }
                return Err(e);
            }
        }

        Ok(handle)
    }

    fn spawn_task(
        &self,
        descriptor: TaskDescriptor,
        stop: &StopToken,
        handle: &mut WaveHandle,
    ) -> WaveResult<()> {
        let name = descriptor.name.clone();
        let counters = Arc::new(TaskCounters::new());
        let setup = self.config.thread_setup();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<WaveResult<ThreadStatus>>(1);

        let task = PeriodicTask::new(
            descriptor,
            self.clock.clone(),
            self.sink.clone(),
            stop.clone(),
            Arc::clone(&counters),
        )
        .with_status_interval(self.config.status_interval);

        let join = thread::Builder::new()
            .name(format!("sqwave-{name}"))
            .spawn(move || {
                let prepared = prepare_task_thread(&setup);
                let ready = prepared.is_ok();
                // The launcher is blocked on this channel; it cannot be gone.
                let _ = ready_tx.send(prepared);
                if ready {
                    Some(task.run())
                } else {
                    None
                }
            })
            .map_err(|e| WaveError::Spawn {
                task: name.clone(),
                reason: e.to_string(),
            })?;

        let ready = ready_rx.recv();
        handle.tasks.push(TaskHandle {
            name: name.clone(),
            counters,
            join: Some(join),
        });

        match ready {
            Ok(Ok(status)) => {
                debug!(task = %name, ?status, "Task thread ready");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WaveError::Spawn {
                task: name,
                reason: "thread exited before reporting readiness".into(),
            }),
        }
    }

    /// Launch the wave and block until every task has ended.
    ///
    /// In nominal operation tasks never end on their own, so this only
    /// returns after an external stop.
    ///
    /// # Errors
    ///
    /// Returns any launch error, or [`WaveError::Join`] if a task panicked.
    pub fn start(&self, phases: &[PhaseTask]) -> WaveResult<Vec<TaskReport>> {
        self.launch(phases)?.join()
    }
}

struct TaskHandle {
    name: String,
    counters: Arc<TaskCounters>,
    join: Option<JoinHandle<Option<TaskReport>>>,
}

/// Handle to a running wave.
///
/// Dropping the handle requests a stop but does not wait for the tasks.
pub struct WaveHandle {
    stop: StopToken,
    tasks: Vec<TaskHandle>,
}

impl WaveHandle {
    /// Ask every task to exit.
    ///
    /// Sleeping tasks wake early, so the threads end promptly even during
    /// a long start delay.
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    /// The stop token shared by all tasks.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Names of the launched tasks in launch order.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Snapshot of every task's counters.
    pub fn stats(&self) -> Vec<(String, TaskStats)> {
        self.tasks
            .iter()
            .map(|t| (t.name.clone(), t.counters.snapshot()))
            .collect()
    }

    /// Counters of all tasks merged.
    pub fn total_stats(&self) -> TaskStats {
        self.tasks
            .iter()
            .map(|t| t.counters.snapshot())
            .fold(TaskStats::default(), TaskStats::combine)
    }

    /// Whether every task thread has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.join.as_ref().map_or(true, JoinHandle::is_finished))
    }

    /// Wait for every task to exit.
    ///
    /// All threads are joined even if one of them panicked.
    ///
    /// # Errors
    ///
    /// Returns [`WaveError::Join`] naming the first task that panicked.
    pub fn join(mut self) -> WaveResult<Vec<TaskReport>> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        let mut first_error = None;

        for task in &mut self.tasks {
            let Some(join) = task.join.take() else {
                continue;
            };
            match join.join() {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => debug!(task = %task.name, "Task exited during setup"),
                Err(_) => {
                    error!(task = %task.name, "Task thread panicked");
                    first_error.get_or_insert_with(|| WaveError::Join(task.name.clone()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

impl Drop for WaveHandle {
    fn drop(&mut self) {
        if self.tasks.iter().any(|t| t.join.is_some()) {
            self.stop.request_stop();
        }
    }
}
