//! End-to-end scenarios for the square-wave generator.

mod common;
mod config_test;
mod shutdown_test;
mod square_wave_test;
