#![doc = "Real-time execution engine for the square-wave generator."]

pub mod clock;
pub mod orchestrator;
pub mod realtime;
pub mod task;

pub use clock::*;
pub use orchestrator::*;
pub use realtime::*;
pub use task::*;
