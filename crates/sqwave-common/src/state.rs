//! Lifecycle state machine for a periodic task.
//!
//! CREATED → RUNNING → SLEEPING ⇄ EXECUTING, with STOPPED reachable from
//! every state. In nominal operation STOPPED is only entered through a
//! cooperative stop request.

use crate::error::{WaveError, WaveResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Descriptor built, thread not yet running.
    #[default]
    Created,
    /// Thread started and scheduling attributes applied.
    Running,
    /// Blocked until the next absolute deadline.
    Sleeping,
    /// Emitting the task's output value.
    Executing,
    /// Loop exited.
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Sleeping => write!(f, "SLEEPING"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl TaskState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::{Created, Executing, Running, Sleeping, Stopped};

        matches!(
            (self, target),
            (Created, Running)
                | (Running, Sleeping)
                | (Sleeping, Executing)
                | (Executing, Sleeping)
                | (Created | Running | Sleeping | Executing, Stopped)
        )
    }
}

/// Single-writer state holder owned by one task.
#[derive(Debug, Default)]
pub struct TaskStateMachine {
    current: TaskState,
}

impl TaskStateMachine {
    /// Create a state machine in [`TaskState::Created`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.current
    }

    /// Move to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`WaveError::InvalidStateTransition`] if the move is not allowed.
    pub fn transition(&mut self, target: TaskState) -> WaveResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(WaveError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        self.current = target;
        Ok(())
    }
}
