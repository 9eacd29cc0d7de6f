//! Termination signal handling.
//!
//! SIGINT and SIGTERM request shutdown; SIGHUP is recorded and logged but
//! configuration reload is not supported. Handlers only set static atomic
//! flags. The main thread drains them with [`SignalHandler::poll`] and
//! performs the actual shutdown itself, so no handler ever touches the
//! output line.

use nix::sys::signal::Signal;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

static SHUTDOWN_PENDING: AtomicBool = AtomicBool::new(false);
static HANGUP_PENDING: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicU32 = AtomicU32::new(0);

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT (Ctrl+C).
    Interrupt,
    /// SIGHUP.
    Hangup,
}

impl SignalKind {
    fn from_raw(signum: u32) -> Option<Self> {
        match Signal::try_from(c_int::try_from(signum).ok()?).ok()? {
            Signal::SIGTERM => Some(Self::Terminate),
            Signal::SIGINT => Some(Self::Interrupt),
            Signal::SIGHUP => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags observed by the main thread.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a state with no pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Check if a hangup arrived (and clear the flag).
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::AcqRel)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Request reload.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
    }

    fn record_signal(&self) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of signals observed.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Owner of the installed handlers and the shared [`SignalState`].
#[derive(Clone, Default)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install handlers for SIGTERM, SIGINT, and SIGHUP.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be installed.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self::default();

        #[cfg(unix)]
        install_handlers()?;

        Ok(handler)
    }

    /// Move pending signal flags into the shared state.
    ///
    /// Called from the main thread only.
    pub fn poll(&self) {
        let last = LAST_SIGNAL.swap(0, Ordering::AcqRel);
        let kind = SignalKind::from_raw(last);

        if SHUTDOWN_PENDING.swap(false, Ordering::AcqRel) {
            match kind {
                Some(kind) => info!(signal = %kind, "Shutdown signal received"),
                None => info!("Shutdown signal received"),
            }
            self.state.record_signal();
            self.state.request_shutdown();
        }
        if HANGUP_PENDING.swap(false, Ordering::AcqRel) {
            info!("SIGHUP received");
            self.state.record_signal();
            self.state.request_reload();
        }
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Check if a hangup arrived (clears the flag).
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.state.take_reload_request()
    }

    /// Request shutdown without a signal.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
fn install_handlers() -> std::io::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

    extern "C" fn on_shutdown(signum: c_int) {
        LAST_SIGNAL.store(signum as u32, Ordering::Release);
        SHUTDOWN_PENDING.store(true, Ordering::Release);
    }

    extern "C" fn on_hangup(signum: c_int) {
        LAST_SIGNAL.store(signum as u32, Ordering::Release);
        HANGUP_PENDING.store(true, Ordering::Release);
    }

    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let hangup = SigAction::new(
        SigHandler::Handler(on_hangup),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // SAFETY: the handlers only store to static atomics, which is
    // async-signal-safe.
    unsafe {
        sigaction(Signal::SIGTERM, &shutdown)?;
        sigaction(Signal::SIGINT, &shutdown)?;
        sigaction(Signal::SIGHUP, &hangup)?;
    }

    debug!("Signal handlers installed");
    Ok(())
}

/// Poll for a shutdown request until `timeout` expires.
///
/// Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    loop {
        handler.poll();
        if handler.shutdown_requested() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        std::thread::sleep(poll_interval.min(timeout - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::new();
        assert!(!state.shutdown_requested());
        assert!(!state.take_reload_request());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_reload_flag_is_cleared_on_take() {
        let state = SignalState::new();
        state.request_reload();
        assert!(state.take_reload_request());
        assert!(!state.take_reload_request());
    }

    #[test]
    fn test_manual_shutdown() {
        let handler = SignalHandler::new().unwrap();
        handler.request_shutdown();
        assert!(handler.shutdown_requested());
        assert!(wait_for_shutdown(&handler, Duration::from_millis(0)));
    }

    #[test]
    fn test_wait_times_out() {
        let handler = SignalHandler::default();
        let start = Instant::now();
        assert!(!wait_for_shutdown(&handler, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_kind_from_raw() {
        assert_eq!(
            SignalKind::from_raw(Signal::SIGTERM as u32),
            Some(SignalKind::Terminate)
        );
        assert_eq!(
            SignalKind::from_raw(Signal::SIGHUP as u32),
            Some(SignalKind::Hangup)
        );
        assert_eq!(SignalKind::from_raw(0), None);
        assert_eq!(SignalKind::Interrupt.to_string(), "SIGINT");
    }
}
