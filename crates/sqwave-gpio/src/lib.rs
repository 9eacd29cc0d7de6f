//! Digital output sinks.
//!
//! This crate provides:
//! - [`OutputSink`] trait, the only side-effecting interface the periodic tasks see
//! - [`chardev`] module with the Linux GPIO character-device line
//! - [`simulated`] module with an in-memory line for tests
//! - [`open_sink`] to build the configured sink

pub mod chardev;
pub mod simulated;

pub use chardev::*;
pub use simulated::*;
pub use sqwave_common::Level;

use sqwave_common::config::{OutputConfig, OutputDriver};
use sqwave_common::WaveResult;
use std::sync::Arc;
use tracing::info;

/// A digital output line shared by every periodic task.
///
/// Implementations serialise concurrent `set` calls internally; callers
/// never need an application-level lock because they only write a scalar.
pub trait OutputSink: Send + Sync {
    /// Drive the line to `value`.
    ///
    /// Must not panic. Returns [`sqwave_common::WaveError::Io`] on a write
    /// failure and [`sqwave_common::WaveError::Closed`] after [`close`](Self::close).
    fn set(&self, value: Level) -> WaveResult<()>;

    /// Release the line and its device.
    ///
    /// Idempotent: closing an already-closed sink succeeds.
    fn close(&self) -> WaveResult<()>;

    /// Whether the sink still holds its resources.
    fn is_open(&self) -> bool;
}

impl<S: OutputSink + ?Sized> OutputSink for Arc<S> {
    fn set(&self, value: Level) -> WaveResult<()> {
        (**self).set(value)
    }

    fn close(&self) -> WaveResult<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Open and configure the sink named by the configuration.
///
/// # Errors
///
/// Returns [`sqwave_common::WaveError::HardwareUnavailable`] or
/// [`sqwave_common::WaveError::LineUnavailable`] if the GPIO line cannot be claimed.
/// Nothing stays open when an error is returned.
pub fn open_sink(config: &OutputConfig) -> WaveResult<Arc<dyn OutputSink>> {
    match config.driver {
        OutputDriver::Gpio => {
            let chip = GpioChip::open(&config.chip)?;
            let line = chip.request_output(config.line, config.initial, &config.consumer)?;
            Ok(Arc::new(line))
        }
        OutputDriver::Simulated => {
            info!(line = config.line, "Using simulated output line");
            let sink = SimulatedSink::new();
            sink.set(config.initial)?;
            Ok(Arc::new(sink))
        }
    }
}
