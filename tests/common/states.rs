//! Scripted states for driving the orchestrator without the deployment library.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::context::ExecutionContext;
use stepwise_core::error::{StateError, StateResult};
use stepwise_core::models::{
    ContextElement, ExecutionResponse, RemoteTask, StateType, TaskScope, TaskType, WaitMode,
};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::states::{ResponseMap, State};

/// Completes inline with a fixed status, optionally publishing elements
pub struct Finish {
    name: String,
    status: ExecutionStatus,
    message: Option<String>,
    context: Vec<ContextElement>,
    notify: Vec<ContextElement>,
}

impl Finish {
    pub fn success(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ExecutionStatus::Success,
            message: None,
            context: Vec::new(),
            notify: Vec::new(),
        }
    }

    pub fn failed(name: &str, message: &str) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            message: Some(message.to_string()),
            ..Self::success(name)
        }
    }

    pub fn publishing(mut self, element: ContextElement) -> Self {
        self.context.push(element);
        self
    }

    pub fn notifying(mut self, element: ContextElement) -> Self {
        self.notify.push(element);
        self
    }
}

#[async_trait]
impl State for Finish {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Custom
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        let mut response = ExecutionResponse::terminal(self.status)
            .with_notify_elements(self.notify.clone());
        for element in &self.context {
            response = response.with_context_element(element.clone());
        }
        if let Some(message) = &self.message {
            response = response.with_error_message(message.clone());
        }
        Ok(response)
    }
}

/// Where an [`AwaitTokens`] state takes its wait ids from
#[derive(Clone)]
pub enum TokenSource {
    Fixed(Vec<String>),
    /// One token named after the value of a param visible to the instance
    FromParam(String),
}

/// Queues one remote task per token, suspends on all of them and records every resume
pub struct AwaitTokens {
    name: String,
    tokens: TokenSource,
    timeout: Duration,
    mode: WaitMode,
    pub resumes: Arc<Mutex<Vec<Vec<String>>>>,
    pub aborts: Arc<AtomicUsize>,
}

impl AwaitTokens {
    pub fn new(name: &str, tokens: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tokens: TokenSource::Fixed(tokens.iter().map(|token| token.to_string()).collect()),
            timeout: Duration::from_secs(600),
            mode: WaitMode::All,
            resumes: Arc::default(),
            aborts: Arc::default(),
        }
    }

    pub fn from_param(name: &str, param: &str) -> Self {
        Self {
            tokens: TokenSource::FromParam(param.to_string()),
            ..Self::new(name, &[])
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resume on the first response instead of all of them
    pub fn any(mut self) -> Self {
        self.mode = WaitMode::Any;
        self
    }

    fn tokens(&self, ctx: &ExecutionContext) -> StateResult<Vec<String>> {
        match &self.tokens {
            TokenSource::Fixed(tokens) => Ok(tokens.clone()),
            TokenSource::FromParam(param) => match ctx.param(param) {
                Some(Value::String(token)) => Ok(vec![token.clone()]),
                _ => Err(StateError::configuration(format!("param {param} is not visible"))),
            },
        }
    }
}

#[async_trait]
impl State for AwaitTokens {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Custom
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        let tokens = self.tokens(ctx)?;
        for token in &tokens {
            let task = RemoteTask::new(
                TaskType::CommandExecution,
                serde_json::json!({"state": self.name}),
                TaskScope {
                    account_id: ctx.account_id().to_string(),
                    app_id: ctx.app_id().to_string(),
                    ..TaskScope::default()
                },
                10_000,
                token.clone(),
            );
            ctx.services().dispatcher.queue(task).await?;
        }
        Ok(ExecutionResponse::asynchronous(tokens, self.mode))
    }

    async fn handle_async_response(
        &self,
        _ctx: &ExecutionContext,
        responses: &ResponseMap,
    ) -> StateResult<ExecutionResponse> {
        self.resumes
            .lock()
            .push(responses.iter().map(|received| received.token.clone()).collect());

        let status = responses
            .iter()
            .map(|received| received.response.execution_status())
            .fold(ExecutionStatus::Success, ExecutionStatus::worst_of);
        let message = responses
            .iter()
            .find_map(|received| received.response.error_message().map(str::to_string));

        let mut response = ExecutionResponse::terminal(status);
        if let Some(message) = message {
            response = response.with_error_message(message);
        }
        Ok(response)
    }

    async fn handle_abort_event(&self, _ctx: &ExecutionContext) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Captures rendered templates and visible params of the instance it runs as
pub struct Capture {
    name: String,
    template: Option<String>,
    pub rendered: Arc<Mutex<Vec<String>>>,
    pub hosts_seen: Arc<Mutex<Vec<usize>>>,
}

impl Capture {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            template: None,
            rendered: Arc::default(),
            hosts_seen: Arc::default(),
        }
    }

    pub fn rendering(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }
}

#[async_trait]
impl State for Capture {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Custom
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        if let Some(template) = &self.template {
            let rendered = ctx.render(template)?;
            self.rendered.lock().push(rendered);
        }
        if let Ok(list) = ctx.instance_list() {
            self.hosts_seen.lock().push(list.instances.len());
        }
        Ok(ExecutionResponse::success())
    }
}

/// Panics while executing
pub struct Explode(pub &'static str);

#[async_trait]
impl State for Explode {
    fn name(&self) -> &str {
        self.0
    }

    fn state_type(&self) -> StateType {
        StateType::Custom
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        panic!("disk full");
    }
}
