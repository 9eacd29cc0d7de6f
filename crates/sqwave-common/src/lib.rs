#![doc = "Common types shared across the square-wave workspace."]

pub mod config;
pub mod error;
pub mod level;
pub mod metrics;
pub mod state;
pub mod time;

pub use config::*;
pub use error::*;
pub use level::*;
pub use metrics::*;
pub use state::*;
pub use time::*;
