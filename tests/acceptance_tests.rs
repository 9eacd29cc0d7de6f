//! Acceptance tests for the square-wave generator.
//!
//! These tests drive the full stack (orchestrator, periodic tasks, output
//! sink) end to end:
//! - Phase-locked alternation on simulated time
//! - Non-fatal write failures with real threads
//! - Clean, idempotent shutdown
//!
//! None of them need root, a PREEMPT_RT kernel, or a GPIO chip.

mod acceptance;
