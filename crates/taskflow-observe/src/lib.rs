//! Observability setup for processes embedding the taskflow engine.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
