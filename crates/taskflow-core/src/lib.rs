//! Workflow execution engine.
//!
//! Takes a declarative task graph plus runtime input, validates both,
//! dispatches ready tasks to registered component actors, tracks per-task and
//! per-execution state, applies retry and error-routing policy, and persists
//! executions and checkpoints through a pluggable [`store::StorageAdapter`].
//! This crate has no filesystem-backed or database adapters of its own; those
//! live in `taskflow-infra`.

pub mod action;
pub mod engine;
pub mod event;
pub mod store;
pub mod workflow;

pub use engine::{
    EngineError, ExecutionReport, Progress, RestoreOptions, SubmitOptions, WorkflowEngine,
};
