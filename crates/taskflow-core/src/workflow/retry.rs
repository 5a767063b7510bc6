//! Retry and error-routing policy.
//!
//! A pure decision function: given a failed task it answers retry (after a
//! backoff delay), route to a recovery task, or fail the execution. It never
//! sleeps or dispatches; the scheduler acts on the decision.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use taskflow_types::workflow::{TaskError, TaskRunState};

use super::expression::{EvalContext, ExpressionError};
use super::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// PolicyDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteVia {
    /// One of the task's own error transitions matched.
    Transition,
    /// A workflow-wide error handler matched.
    Handler,
}

impl RouteVia {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteVia::Transition => "transition",
            RouteVia::Handler => "handler",
        }
    }
}

impl fmt::Display for RouteVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Retry { delay: Duration, next_attempt: u32 },
    Route { target: usize, via: RouteVia },
    Fail,
}

// ---------------------------------------------------------------------------
// ErrorPolicy
// ---------------------------------------------------------------------------

pub struct ErrorPolicy<'g> {
    graph: &'g WorkflowGraph,
}

impl<'g> ErrorPolicy<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        Self { graph }
    }

    /// Decide what happens to a failed task.
    ///
    /// Order: retry while attempts remain and the kind is retriable, then the
    /// task's error transitions in declaration order (guards see the failure
    /// under `error`), then workflow handlers (kind-specific before
    /// catch-all). An error transition whose guard cannot be evaluated is
    /// returned as an error rather than skipped.
    pub fn decide(
        &self,
        task: usize,
        failed: &TaskRunState,
        ctx: &EvalContext<'_>,
    ) -> Result<PolicyDecision, ExpressionError> {
        let fallback;
        let error = match &failed.error {
            Some(error) => error,
            None => {
                fallback = TaskError::execution("task failed without an error");
                &fallback
            }
        };

        if let Some(retry) = &self.graph.task(task).retry {
            if failed.attempt < retry.max_attempts && retry.retries_kind(error.kind) {
                return Ok(PolicyDecision::Retry {
                    delay: retry.delay_for_attempt(failed.attempt),
                    next_attempt: failed.attempt + 1,
                });
            }
        }

        let error_value: Value = error.to_expression_value();
        let error_ctx = ctx.with_error(&error_value);
        for edge in self.graph.node(task).transitions.iter().filter(|e| e.on_error) {
            let Some(guard) = &edge.guard else { continue };
            if guard.evaluate(&error_ctx)?.truthy() {
                return Ok(PolicyDecision::Route {
                    target: edge.target,
                    via: RouteVia::Transition,
                });
            }
        }

        let handlers = self.graph.handlers();
        let specific = handlers
            .iter()
            .find(|h| h.error_kind == Some(error.kind) && h.target != task);
        let catch_all = || {
            handlers
                .iter()
                .find(|h| h.error_kind.is_none() && h.target != task)
        };
        if let Some(handler) = specific.or_else(catch_all) {
            return Ok(PolicyDecision::Route {
                target: handler.target,
                via: RouteVia::Handler,
            });
        }

        Ok(PolicyDecision::Fail)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
