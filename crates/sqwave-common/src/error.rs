use thiserror::Error;

/// Error types covering configuration, real-time setup, hardware access, and task lifecycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WaveError {
    /// Configuration or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Memory locking or scheduling attribute setup failed.
    #[error("real-time setup failed: {0}")]
    Realtime(String),

    /// The GPIO chip (or other output device) could not be opened.
    #[error("hardware unavailable: {device}: {reason}")]
    HardwareUnavailable {
        /// Device identifier (e.g. `/dev/gpiochip0`).
        device: String,
        /// Underlying cause.
        reason: String,
    },

    /// The requested output line is out of range or already claimed.
    #[error("line {line} unavailable: {reason}")]
    LineUnavailable {
        /// Line offset on the chip.
        line: u32,
        /// Underlying cause.
        reason: String,
    },

    /// Writing a value to the output failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The output sink was used after being closed.
    #[error("output sink is closed")]
    Closed,

    /// A task thread could not be created.
    #[error("failed to spawn task {task}: {reason}")]
    Spawn {
        /// Task name.
        task: String,
        /// Underlying cause.
        reason: String,
    },

    /// A task thread panicked or could not be joined.
    #[error("failed to join task {0}")]
    Join(String),

    /// Invalid task state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Convenience type alias for square-wave operations.
pub type WaveResult<T> = Result<T, WaveError>;
