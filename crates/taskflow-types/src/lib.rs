//! Shared domain types for taskflow.
//!
//! Workflow definitions, execution and task status machines, per-execution
//! state, checkpoints, lifecycle events and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod workflow;
