//! Real-time scheduling and memory locking utilities.
//!
//! Provides platform-specific initialization for deterministic execution:
//! - Memory locking (mlockall) to prevent page faults, once per process
//! - Fixed-priority scheduling (SCHED_FIFO/SCHED_RR) applied by each task thread to itself
//! - CPU affinity to keep task threads on isolated cores

#![allow(unused_imports)] // Platform-specific code may not use all imports

use sqwave_common::config::{CpuAffinity, InheritSched, RealtimeConfig, SchedAttrs, SchedPolicy};
use sqwave_common::error::{WaveError, WaveResult};
use tracing::{debug, error, info, warn};

/// Result of process-wide real-time initialization.
#[derive(Debug, Clone, Default)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
    /// Capabilities observed at startup.
    pub capabilities: RtCapabilities,
}

/// Initialize the process-wide real-time environment.
///
/// Must run before any task thread is spawned so that `MCL_FUTURE` covers
/// their stacks.
///
/// # Errors
///
/// Returns an error if a required RT feature fails to initialize. With
/// `fail_fast = false`, missing privileges are logged and tolerated.
///
/// # Platform Support
///
/// Full support on Linux with PREEMPT_RT kernel.
/// Partial/no-op on macOS and other platforms.
pub fn init_realtime(config: &RealtimeConfig) -> WaveResult<RealtimeStatus> {
    if !config.enabled {
        info!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus::default());
    }

    if config.fail_fast {
        info!("Validating real-time capabilities (fail_fast=true)");
        validate_rt_capabilities(config)?;
    }

    let memory_locked = if config.lock_memory {
        lock_memory(config.fail_fast)?
    } else {
        false
    };

    let status = RealtimeStatus {
        memory_locked,
        capabilities: check_rt_capabilities(),
    };

    info!(?status, "Real-time initialization complete");
    Ok(status)
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory(fail_fast: bool) -> WaveResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            Ok(true)
        }
        Err(e) if e == nix::errno::Errno::EPERM && !fail_fast => {
            warn!(
                "mlockall failed with EPERM - running without CAP_IPC_LOCK capability. \
                 Page faults may occur during execution."
            );
            Ok(false)
        }
        Err(e) => Err(WaveError::Realtime(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory(_fail_fast: bool) -> WaveResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Per-thread setup applied by every task thread before its first deadline.
#[derive(Debug, Clone, Default)]
pub struct ThreadSetup {
    /// Scheduling attributes, or `None` to leave the thread's defaults alone.
    pub sched: Option<SchedAttrs>,
    /// CPUs to pin the thread to.
    pub cpu_affinity: CpuAffinity,
    /// Treat missing privileges as fatal.
    pub fail_fast: bool,
}

impl ThreadSetup {
    /// Derive the thread setup from the real-time configuration.
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            sched: config.enabled.then(|| config.sched_attrs()),
            cpu_affinity: if config.enabled {
                config.cpu_affinity.clone()
            } else {
                CpuAffinity::None
            },
            fail_fast: config.fail_fast,
        }
    }
}

/// What a task thread actually got.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    /// Applied scheduler policy.
    pub policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpus: Option<Vec<usize>>,
}

/// Apply scheduling attributes and CPU affinity to the calling thread.
///
/// # Errors
///
/// Returns [`WaveError::Realtime`] if an attribute cannot be applied and the
/// setup is `fail_fast`.
pub fn prepare_task_thread(setup: &ThreadSetup) -> WaveResult<ThreadStatus> {
    let (policy, priority) = match &setup.sched {
        Some(attrs) => apply_sched_attrs(attrs, setup.fail_fast)?,
        None => (None, None),
    };
    let cpus = set_cpu_affinity(&setup.cpu_affinity)?;

    Ok(ThreadStatus {
        policy,
        priority,
        cpus,
    })
}

/// Set scheduler policy and priority of the calling thread.
#[cfg(target_os = "linux")]
pub fn apply_sched_attrs(
    attrs: &SchedAttrs,
    fail_fast: bool,
) -> WaveResult<(Option<SchedPolicy>, Option<u8>)> {
    if attrs.inherit == InheritSched::Inherit {
        debug!("Scheduling attributes inherited from the spawning thread");
        return Ok((None, None));
    }

    let (linux_policy, priority) = match attrs.policy {
        SchedPolicy::Fifo => (libc::SCHED_FIFO, attrs.priority.clamp(1, 99)),
        SchedPolicy::Rr => (libc::SCHED_RR, attrs.priority.clamp(1, 99)),
        SchedPolicy::Other => (libc::SCHED_OTHER, 0),
    };

    if attrs.policy != SchedPolicy::Other && priority != attrs.priority {
        warn!(
            original = attrs.priority,
            clamped = priority,
            "Scheduler priority clamped to valid range"
        );
    }

    let param = libc::sched_param {
        sched_priority: i32::from(priority),
    };

    // SAFETY: pthread_self() is always a valid handle for the calling thread.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), linux_policy, &param) };

    if rc != 0 {
        let err = std::io::Error::from_raw_os_error(rc);
        if rc == libc::EPERM && !fail_fast {
            warn!(
                policy = ?attrs.policy,
                "pthread_setschedparam failed with EPERM - running without RT privileges. \
                 Consider running with CAP_SYS_NICE capability or as root."
            );
            return Ok((None, None));
        }
        return Err(WaveError::Realtime(format!(
            "pthread_setschedparam({:?}, {priority}) failed: {err}",
            attrs.policy
        )));
    }

    debug!(policy = ?attrs.policy, priority, "Thread scheduling attributes applied");
    Ok((Some(attrs.policy), Some(priority)))
}

#[cfg(not(target_os = "linux"))]
pub fn apply_sched_attrs(
    attrs: &SchedAttrs,
    _fail_fast: bool,
) -> WaveResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(
        policy = ?attrs.policy,
        priority = attrs.priority,
        "Real-time scheduling not available on this platform"
    );
    Ok((None, None))
}

/// Set CPU affinity for the calling thread.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(affinity: &CpuAffinity) -> WaveResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = affinity.cpus();
    if cpus.is_empty() {
        return Ok(None);
    }

    debug!(?cpus, "Setting CPU affinity");

    let mut cpu_set = CpuSet::new();
    for &cpu in &cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| WaveError::Config(format!("Invalid CPU index {cpu}: {e}")))?;
    }

    // Pid 0 targets the calling thread.
    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            info!(?cpus, "CPU affinity set");
            Ok(Some(cpus))
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(?cpus, "Invalid CPU set - some CPUs may not exist");
            Ok(None)
        }
        Err(e) => Err(WaveError::Realtime(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(affinity: &CpuAffinity) -> WaveResult<Option<Vec<usize>>> {
    if !matches!(affinity, CpuAffinity::None) {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

/// Read the privileges and kernel features that decide edge timing quality.
#[cfg(target_os = "linux")]
pub fn check_rt_capabilities() -> RtCapabilities {
    use nix::sys::resource::{getrlimit, Resource};

    let rtprio = getrlimit(Resource::RLIMIT_RTPRIO).ok();
    let memlock = getrlimit(Resource::RLIMIT_MEMLOCK).ok();

    RtCapabilities {
        is_root: nix::unistd::geteuid().is_root(),
        rtprio_limit: rtprio.map(|(soft, _)| soft),
        memlock_unlimited: memlock.is_some_and(|(soft, _)| soft == libc::RLIM_INFINITY),
        preempt_rt: std::fs::read_to_string("/proc/version")
            .is_ok_and(|v| v.contains("PREEMPT_RT") || v.contains("PREEMPT RT")),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// What this process may do to keep the wave's edges on time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtCapabilities {
    /// Effective user is root.
    pub is_root: bool,
    /// Soft `RLIMIT_RTPRIO`: highest real-time priority a task thread may take.
    pub rtprio_limit: Option<u64>,
    /// Soft `RLIMIT_MEMLOCK` is unlimited, so `mlockall` can pin every page.
    pub memlock_unlimited: bool,
    /// The kernel is built with `PREEMPT_RT`.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Whether a task thread can switch itself to a real-time policy at `priority`.
    pub fn allows_priority(&self, priority: u8) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l >= u64::from(priority))
    }

    /// Whether the task stacks and the output path can be locked in RAM.
    pub fn allows_memory_lock(&self) -> bool {
        self.is_root || self.memlock_unlimited
    }

    /// Reasons the wave could not run as `config` asks, one per entry.
    pub fn shortfalls(&self, config: &RealtimeConfig) -> Vec<String> {
        let mut shortfalls = Vec::new();

        if config.policy != SchedPolicy::Other && !self.allows_priority(config.priority) {
            let limit = self
                .rtprio_limit
                .map_or_else(|| "unknown".to_string(), |l| l.to_string());
            let policy = format!("SCHED_{:?}", config.policy).to_uppercase();
            let priority = config.priority;
            shortfalls.push(format!(
                "high/low task threads cannot take {policy} priority {priority} \
                 (RLIMIT_RTPRIO is {limit}); ordinary processes would delay the edges. \
                 Run as root, grant CAP_SYS_NICE, or raise rtprio to {priority} in limits.conf"
            ));
        }

        if config.lock_memory && !self.allows_memory_lock() {
            shortfalls.push(
                "memory cannot be locked (RLIMIT_MEMLOCK is limited); a page fault inside a \
                 task would stretch a half-period. Run as root, grant CAP_IPC_LOCK, or set \
                 memlock to unlimited"
                    .to_string(),
            );
        }

        shortfalls
    }
}

/// Refuse to start a wave whose timing guarantees cannot be met.
///
/// A missing `PREEMPT_RT` kernel only warns: the wave still runs, with more
/// jitter on each edge.
///
/// # Errors
///
/// Returns [`WaveError::Realtime`] listing every shortfall reported by
/// [`RtCapabilities::shortfalls`].
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> WaveResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let caps = check_rt_capabilities();
    if !caps.preempt_rt {
        warn!("Kernel is not PREEMPT_RT; expect tens of microseconds of edge jitter");
    }

    let shortfalls = caps.shortfalls(config);
    if shortfalls.is_empty() {
        info!(?caps, "Privileges allow real-time edge timing");
        return Ok(());
    }

    let message = format!(
        "square wave cannot meet its timing with fail_fast set:\n  - {}",
        shortfalls.join("\n  - ")
    );
    error!("{message}");
    Err(WaveError::Realtime(message))
}
