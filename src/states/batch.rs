use super::remote_call::{
    CallOutcome, DeploymentTarget, RemoteCallStrategy, RequestPlan, StrategyOutput, TaskRequest,
};
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{StateType, TaskType};
use serde_json::{json, Value};

/// Runs a command on every visible host, `batch_size` hosts per remote task.
/// The state resumes once, after the last batch reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBatchStrategy {
    command: String,
    batch_size: usize,
}

impl HostBatchStrategy {
    /// `command` may reference context expressions such as `${artifact.build_no}`
    pub fn new(command: impl Into<String>, batch_size: usize) -> Self {
        Self {
            command: command.into(),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl RemoteCallStrategy for HostBatchStrategy {
    fn state_type(&self) -> StateType {
        StateType::HostBatchCommand
    }

    fn task_type(&self) -> TaskType {
        TaskType::CommandExecution
    }

    fn command_name(&self) -> &str {
        "Execute Command"
    }

    fn plan(&self, ctx: &ExecutionContext, _target: &DeploymentTarget) -> StateResult<RequestPlan> {
        if self.batch_size == 0 {
            return Err(StateError::configuration("Host batch size must be at least 1"));
        }
        let command = ctx.render(&self.command)?;
        let list = ctx
            .instance_list()
            .map_err(|_| StateError::configuration("No instance list is visible to a host batch"))?;

        let chunks: Vec<_> = list.instances.chunks(self.batch_size).collect();
        let batch_count = chunks.len();
        let requests = chunks
            .into_iter()
            .enumerate()
            .map(|(index, hosts)| {
                let host_names: Vec<&str> = hosts.iter().map(|host| host.host_name.as_str()).collect();
                TaskRequest::new(
                    format!("batch_{}", index + 1),
                    json!({
                        "command": command,
                        "hosts": host_names,
                        "batch_index": index + 1,
                        "batch_count": batch_count,
                    }),
                )
            })
            .collect();

        Ok(RequestPlan {
            requests,
            data: json!({ "batch_count": batch_count, "command": command }),
        })
    }

    fn on_responses(
        &self,
        _ctx: &ExecutionContext,
        outcome: &CallOutcome<'_>,
    ) -> StateResult<StrategyOutput> {
        let batches: Vec<Value> = outcome
            .requests
            .iter()
            .map(|request| {
                json!({
                    "batch": request.label,
                    "status": request.status(),
                    "attempts": request.attempts,
                })
            })
            .collect();
        Ok(StrategyOutput {
            result: Some(json!({ "batches": batches })),
            ..StrategyOutput::default()
        })
    }
}
