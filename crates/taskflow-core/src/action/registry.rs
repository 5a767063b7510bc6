//! Lookup table of actor clients keyed by component name.

use std::collections::HashMap;

use serde_json::Value;
use taskflow_types::workflow::TaskError;

use super::component::{BoxComponentAction, ComponentAction};

/// The engine's single entry point to external actors:
/// `invoke(component, action, input)`.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    components: HashMap<String, BoxComponentAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ComponentAction + 'static>(&mut self, name: impl Into<String>, component: T) {
        self.components
            .insert(name.into(), BoxComponentAction::new(component));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: ComponentAction + 'static>(mut self, name: impl Into<String>, component: T) -> Self {
        self.register(name, component);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.components.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Route an action to its component. A component nobody registered is
    /// reported as unavailable.
    pub async fn invoke(
        &self,
        component: &str,
        action: &str,
        input: Value,
    ) -> Result<Value, TaskError> {
        let Some(actor) = self.components.get(component) else {
            return Err(TaskError::unavailable(format!(
                "no actor registered for component '{component}'"
            )));
        };
        actor.invoke(action, input).await
    }
}
