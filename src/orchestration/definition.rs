//! Workflow graphs and the registry the orchestrator resolves them from.

use crate::config::{ConfigResult, ConfigurationError};
use crate::state_machine::ExecutionStatus;
use crate::states::State;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A named graph of states with success and failure edges
pub struct WorkflowDefinition {
    id: String,
    initial_state: String,
    states: HashMap<String, Arc<dyn State>>,
    on_success: HashMap<String, String>,
    on_failure: HashMap<String, String>,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut states: Vec<&String> = self.states.keys().collect();
        states.sort();
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("initial_state", &self.initial_state)
            .field("states", &states)
            .field("on_success", &self.on_success)
            .field("on_failure", &self.on_failure)
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn builder(id: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            id: id.into(),
            initial_state: None,
            states: Vec::new(),
            on_success: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn state(&self, name: &str) -> Option<Arc<dyn State>> {
        self.states.get(name).cloned()
    }

    pub fn states(&self) -> impl Iterator<Item = &Arc<dyn State>> {
        self.states.values()
    }

    /// Successor of `from` for a terminal status. SKIPPED follows the success edge.
    pub fn next_state(&self, from: &str, status: ExecutionStatus) -> Option<&str> {
        let edges = if status.is_successful() {
            &self.on_success
        } else {
            &self.on_failure
        };
        edges.get(from).map(String::as_str)
    }
}

pub struct WorkflowDefinitionBuilder {
    id: String,
    initial_state: Option<String>,
    states: Vec<Arc<dyn State>>,
    on_success: Vec<(String, String)>,
    on_failure: Vec<(String, String)>,
}

impl WorkflowDefinitionBuilder {
    /// Add a state. The first one added is the initial state unless `initial` says otherwise.
    pub fn state(mut self, state: impl State + 'static) -> Self {
        self.states.push(Arc::new(state));
        self
    }

    pub fn shared_state(mut self, state: Arc<dyn State>) -> Self {
        self.states.push(state);
        self
    }

    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial_state = Some(name.into());
        self
    }

    pub fn on_success(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.on_success.push((from.into(), to.into()));
        self
    }

    pub fn on_failure(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.on_failure.push((from.into(), to.into()));
        self
    }

    pub fn build(self) -> ConfigResult<WorkflowDefinition> {
        let id = self.id;
        let invalid = |reason: String| ConfigurationError::invalid_workflow(&id, reason);

        let mut states: HashMap<String, Arc<dyn State>> = HashMap::with_capacity(self.states.len());
        let mut first = None;
        for state in self.states {
            let name = state.name().to_string();
            if name.is_empty() {
                return Err(invalid("state names must not be empty".to_string()));
            }
            if states.contains_key(&name) {
                return Err(invalid(format!("state '{name}' is defined twice")));
            }
            first.get_or_insert_with(|| name.clone());
            states.insert(name, state);
        }

        let initial_state = self
            .initial_state
            .or(first)
            .ok_or_else(|| invalid("workflow has no states".to_string()))?;
        if !states.contains_key(&initial_state) {
            return Err(invalid(format!("initial state '{initial_state}' is not defined")));
        }

        let mut edges = [HashMap::new(), HashMap::new()];
        for (slot, transitions) in [self.on_success, self.on_failure].into_iter().enumerate() {
            for (from, to) in transitions {
                for name in [&from, &to] {
                    if !states.contains_key(name) {
                        return Err(invalid(format!("transition references unknown state '{name}'")));
                    }
                }
                if edges[slot].insert(from.clone(), to).is_some() {
                    return Err(invalid(format!("state '{from}' has two transitions for the same outcome")));
                }
            }
        }
        let [on_success, on_failure] = edges;

        Ok(WorkflowDefinition {
            id,
            initial_state,
            states,
            on_success,
            on_failure,
        })
    }
}

/// Every workflow definition an orchestrator can run, passed in at construction
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> ConfigResult<()> {
        if self.definitions.contains_key(definition.id()) {
            return Err(ConfigurationError::invalid_workflow(
                definition.id(),
                "a workflow with this id is already registered",
            ));
        }
        self.definitions
            .insert(definition.id().to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn with(mut self, definition: WorkflowDefinition) -> ConfigResult<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Check that every container state points at a registered workflow
    pub fn validate(&self) -> ConfigResult<()> {
        for definition in self.definitions.values() {
            for state in definition.states() {
                for child in state.child_workflows() {
                    if !self.definitions.contains_key(&child) {
                        return Err(ConfigurationError::invalid_workflow(
                            definition.id(),
                            format!(
                                "state '{}' spawns unknown workflow '{child}'",
                                state.name()
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
