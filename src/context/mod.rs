//! # Execution Context
//!
//! The view a state receives for one invocation: the instance snapshot, every
//! contextual element visible from it (own stack first, then each ancestor's,
//! nearest first), expression rendering, the collaborator bundle and a handle to
//! the orchestrator's interrupt queue. A context is built per call and dropped
//! when the call returns; anything that must survive goes on the instance.

pub mod render;

use crate::config::EngineConfig;
use crate::models::{
    ContainerServiceElement, ContextElement, ContextElementType, InstanceListElement,
    PhaseElement, ServiceSetupElement, StateExecutionData, StateExecutionInstance,
    WorkflowStandardParams,
};
use crate::orchestration::{ExecutionInterrupt, InterruptSender};
use crate::services::StateServices;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use render::{render_template, render_value};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("No {0} element is visible from this state")]
    ElementNotFound(ContextElementType),

    #[error("Unresolved expression ${{{placeholder}}}")]
    UnresolvedPlaceholder { placeholder: String },

    #[error("Malformed expression in '{template}'")]
    MalformedTemplate { template: String },
}

pub type ContextResult<T> = Result<T, ContextError>;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    instance: StateExecutionInstance,
    elements: Vec<ContextElement>,
    services: Arc<StateServices>,
    interrupts: InterruptSender,
    config: Arc<EngineConfig>,
}

impl ExecutionContext {
    /// `elements` must already be ordered nearest first
    pub fn new(
        instance: StateExecutionInstance,
        elements: Vec<ContextElement>,
        services: Arc<StateServices>,
        interrupts: InterruptSender,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            instance,
            elements,
            services,
            interrupts,
            config,
        }
    }

    pub fn instance(&self) -> &StateExecutionInstance {
        &self.instance
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance.id
    }

    pub fn workflow_execution_id(&self) -> &str {
        &self.instance.workflow_execution_id
    }

    pub fn app_id(&self) -> &str {
        &self.instance.app_id
    }

    pub fn account_id(&self) -> &str {
        &self.instance.account_id
    }

    pub fn services(&self) -> &StateServices {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution data written by a previous call on this instance
    pub fn execution_data(&self) -> Option<&StateExecutionData> {
        self.instance.state_execution_data.as_ref()
    }

    pub fn elements(&self) -> &[ContextElement] {
        &self.elements
    }

    /// Nearest visible element of the given type
    pub fn nearest(&self, element_type: ContextElementType) -> Option<&ContextElement> {
        self.elements
            .iter()
            .find(|element| element.element_type() == element_type)
    }

    pub fn require(&self, element_type: ContextElementType) -> ContextResult<&ContextElement> {
        self.nearest(element_type)
            .ok_or(ContextError::ElementNotFound(element_type))
    }

    pub fn standard_params(&self) -> ContextResult<&WorkflowStandardParams> {
        match self.require(ContextElementType::Standard)? {
            ContextElement::Standard(params) => Ok(params),
            _ => Err(ContextError::ElementNotFound(ContextElementType::Standard)),
        }
    }

    pub fn phase(&self) -> ContextResult<&PhaseElement> {
        match self.require(ContextElementType::Phase)? {
            ContextElement::Phase(phase) => Ok(phase),
            _ => Err(ContextError::ElementNotFound(ContextElementType::Phase)),
        }
    }

    pub fn service_setup(&self) -> ContextResult<&ServiceSetupElement> {
        match self.require(ContextElementType::ServiceSetup)? {
            ContextElement::ServiceSetup(setup) => Ok(setup),
            _ => Err(ContextError::ElementNotFound(ContextElementType::ServiceSetup)),
        }
    }

    pub fn instance_list(&self) -> ContextResult<&InstanceListElement> {
        match self.require(ContextElementType::InstanceList)? {
            ContextElement::InstanceList(list) => Ok(list),
            _ => Err(ContextError::ElementNotFound(ContextElementType::InstanceList)),
        }
    }

    pub fn container_service(&self) -> ContextResult<&ContainerServiceElement> {
        match self.require(ContextElementType::ContainerService)? {
            ContextElement::ContainerService(service) => Ok(service),
            _ => Err(ContextError::ElementNotFound(
                ContextElementType::ContainerService,
            )),
        }
    }

    /// Nearest param with this name
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.elements.iter().find_map(|element| match element {
            ContextElement::Param { name: key, value } if key == name => Some(value),
            _ => None,
        })
    }

    pub fn render(&self, template: &str) -> ContextResult<String> {
        render_template(template, &self.elements)
    }

    pub fn render_value(&self, value: &Value) -> ContextResult<Value> {
        render_value(value, &self.elements)
    }

    /// Queue an interrupt for the orchestrator. Never blocks.
    pub fn request_interrupt(&self, interrupt: ExecutionInterrupt) {
        if self.interrupts.send(interrupt).is_err() {
            warn!(
                instance_id = %self.instance.id,
                "Interrupt queue closed, dropping interrupt"
            );
        }
    }
}
