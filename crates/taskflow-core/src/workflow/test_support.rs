//! Builders and scripted actors shared by the workflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use taskflow_types::workflow::{
    ActionRef, InputSchema, JoinType, TaskDefinition, TaskError, WorkflowDefinition,
};
use tokio::time::Instant;

use crate::action::ComponentAction;

/// Minimal definition `test-flow@1.0.0` over the given tasks.
pub fn definition(tasks: Vec<TaskDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "test-flow".to_string(),
        version: "1.0.0".to_string(),
        name: None,
        description: None,
        tasks,
        input_schema: InputSchema::default(),
        error_handlers: Vec::new(),
        start_tasks: Vec::new(),
        max_concurrency: None,
        timeout_secs: None,
        metadata: Default::default(),
    }
}

/// Task `id` calling `test.<id>` after `deps`.
pub fn task(id: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition {
        id: id.to_string(),
        name: None,
        action: ActionRef {
            component: "test".to_string(),
            action: id.to_string(),
        },
        input: Value::Null,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        join: JoinType::All,
        retry: None,
        timeout_secs: None,
        transitions: Vec::new(),
        publish: Default::default(),
    }
}

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Value),
    Err(TaskError),
    /// Sleep, then answer with the value.
    Sleep(Duration, Value),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub action: String,
    pub input: Value,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    steps: HashMap<String, VecDeque<Step>>,
    calls: Vec<Call>,
}

/// Actor answering each action from a queue of steps. Once an action's
/// queue is empty it echoes `{"action": .., "input": ..}`.
#[derive(Clone, Default)]
pub struct ScriptedActor {
    script: Arc<Mutex<Script>>,
}

impl ScriptedActor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, action: &str, step: Step) -> &Self {
        self.script
            .lock()
            .unwrap()
            .steps
            .entry(action.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub fn calls(&self, action: &str) -> Vec<Call> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    pub fn call_order(&self) -> Vec<String> {
        let script = self.script.lock().unwrap();
        script.calls.iter().map(|c| c.action.clone()).collect()
    }
}

impl ComponentAction for ScriptedActor {
    async fn invoke(&self, action: &str, input: Value) -> Result<Value, TaskError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call {
                action: action.to_string(),
                input: input.clone(),
                at: Instant::now(),
            });
            script.steps.get_mut(action).and_then(VecDeque::pop_front)
        };
        match step {
            Some(Step::Ok(value)) => Ok(value),
            Some(Step::Err(err)) => Err(err),
            Some(Step::Sleep(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            None => Ok(json!({"action": action, "input": input})),
        }
    }
}
