//! Task dispatcher: admission control, per-task timeout and cooperative
//! cancellation in front of the action registry.
//!
//! Admission is a counting gate: an optional per-execution semaphore and an
//! optional global semaphore shared by every execution. A task holds one
//! permit of each for the duration of its action call.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use taskflow_types::workflow::{ActionRef, TaskError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::action::ActionRegistry;

/// Per-execution admission gate. Cloning shares the same permits.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGate {
    semaphore: Option<Arc<Semaphore>>,
}

impl ExecutionGate {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Held while a task's action runs; dropping it frees both slots.
#[derive(Debug)]
pub struct DispatchPermit {
    _execution: Option<OwnedSemaphorePermit>,
    _global: Option<OwnedSemaphorePermit>,
}

/// One action call.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: String,
    pub action: ActionRef,
    pub input: Value,
    pub timeout: Option<Duration>,
}

pub struct TaskDispatcher {
    actions: Arc<ActionRegistry>,
    global: Option<Arc<Semaphore>>,
    default_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        actions: Arc<ActionRegistry>,
        max_concurrent_tasks: Option<usize>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            actions,
            global: max_concurrent_tasks.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            default_timeout,
        }
    }

    /// Wait for an execution slot, then a global slot. Returns `None` if the
    /// token is cancelled first.
    pub async fn admit(
        &self,
        gate: &ExecutionGate,
        cancel: &CancellationToken,
    ) -> Option<DispatchPermit> {
        let execution = acquire(gate.semaphore.as_ref(), cancel).await?;
        let global = acquire(self.global.as_ref(), cancel).await?;
        Some(DispatchPermit {
            _execution: execution,
            _global: global,
        })
    }

    /// Invoke the action with the task's timeout.
    ///
    /// Timeouts become `task_timeout`, a cancelled token `cancelled`, and a
    /// panicking actor `task_execution`. All other errors are passed through
    /// as classified by the actor.
    pub async fn invoke(
        &self,
        request: DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let call = AssertUnwindSafe(self.actions.invoke(
            &request.action.component,
            &request.action.action,
            request.input,
        ))
        .catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(task_id = %request.task_id, "task cancelled in flight");
                Err(TaskError::cancelled())
            }
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_panic)) => {
                    tracing::error!(task_id = %request.task_id, action = %request.action, "actor panicked");
                    Err(TaskError::execution(format!("actor for {} panicked", request.action)))
                }
                Err(_elapsed) => Err(TaskError::timeout(format!(
                    "task '{}' exceeded its {}s timeout",
                    request.task_id,
                    timeout.as_secs_f64()
                ))),
            },
        }
    }
}

async fn acquire(
    semaphore: Option<&Arc<Semaphore>>,
    cancel: &CancellationToken,
) -> Option<Option<OwnedSemaphorePermit>> {
    let Some(semaphore) = semaphore else {
        return Some(None);
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        // The semaphores are never closed.
        permit = Arc::clone(semaphore).acquire_owned() => permit.ok().map(Some),
    }
}
