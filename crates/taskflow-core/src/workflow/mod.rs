//! Workflow engine internals.
//!
//! - `definition` -- YAML parsing, structural validation, filesystem load/save
//! - `expression` -- sandboxed expression language for guards, templates and `publish`
//! - `graph` -- validated task graph: references, cycles, reachability, start tasks
//! - `input` -- submit-time input validation against the definition schema
//! - `state` -- single-writer state manager actor for one execution
//! - `retry` -- retry/backoff and error-routing decisions
//! - `dispatcher` -- admission, timeout and cancellation around action calls
//! - `scheduler` -- the run loop that drives one execution to a terminal status
//! - `checkpoint` -- sealed snapshots and restore planning

pub mod checkpoint;
pub mod definition;
pub mod dispatcher;
pub mod expression;
pub mod graph;
pub mod input;
pub mod retry;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
