//! Engine fixtures: in-memory collaborators seeded with one deployment target.

use std::sync::Arc;
use std::time::Duration;
use stepwise_core::config::{DispatcherConfig, EngineConfig};
use stepwise_core::dispatch::{InMemoryTaskDispatcher, TaskReceiver};
use stepwise_core::models::{
    ArtifactElement, ContextElement, GroupCapacity, InstanceElement, InstanceListElement,
    PhaseElement, RemoteTask, ServiceSetupElement, StateExecutionInstance,
};
use stepwise_core::orchestration::{ExecutionArgs, WorkflowOrchestrator, WorkflowRegistry};
use stepwise_core::services::{
    CloudProviderConfig, InMemoryActivityLog, InMemoryInfrastructureLookup,
    InMemorySettingsLookup, InMemorySweepingOutputStore, InfrastructureMapping, StateServices,
    StaticSecretResolver,
};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::store::{InMemoryInstanceStore, InstanceStore};

pub const APP_ID: &str = "app-1";
pub const ACCOUNT_ID: &str = "acct-1";
pub const INFRA_MAPPING_ID: &str = "infra-1";
pub const SETTING_ID: &str = "aws-prod";

/// An orchestrator wired to in-memory collaborators, plus handles on each of them
pub struct TestEngine {
    pub orchestrator: WorkflowOrchestrator,
    pub dispatcher: Arc<InMemoryTaskDispatcher>,
    pub tasks: TaskReceiver,
    pub activities: Arc<InMemoryActivityLog>,
    pub outputs: Arc<InMemorySweepingOutputStore>,
    pub store: Arc<InMemoryInstanceStore>,
}

impl TestEngine {
    pub fn new(registry: WorkflowRegistry) -> Self {
        Self::with_config(registry, test_config())
    }

    pub fn with_config(registry: WorkflowRegistry, config: EngineConfig) -> Self {
        Self::with_store(registry, config, Arc::new(InMemoryInstanceStore::new()))
    }

    /// Share a store between engines to simulate a process restart
    pub fn with_store(
        registry: WorkflowRegistry,
        config: EngineConfig,
        store: Arc<InMemoryInstanceStore>,
    ) -> Self {
        let (dispatcher, tasks) = InMemoryTaskDispatcher::new(&config.dispatcher);
        let dispatcher = Arc::new(dispatcher);
        let activities = Arc::new(InMemoryActivityLog::new());
        let outputs = Arc::new(InMemorySweepingOutputStore::new());

        let infrastructure = InMemoryInfrastructureLookup::new();
        infrastructure.insert(InfrastructureMapping {
            id: INFRA_MAPPING_ID.to_string(),
            app_id: APP_ID.to_string(),
            env_id: "env-prod".to_string(),
            service_id: "svc-web".to_string(),
            compute_provider_setting_id: SETTING_ID.to_string(),
            region: Some("us-east-1".to_string()),
            cluster_name: Some("prod-cluster".to_string()),
            deployment_type: "AMI".to_string(),
        });
        let settings = InMemorySettingsLookup::new();
        settings.insert(CloudProviderConfig {
            setting_id: SETTING_ID.to_string(),
            provider: "aws".to_string(),
            config: serde_json::json!({"account": "123456789012"}),
        });

        let services = Arc::new(StateServices {
            infrastructure: Arc::new(infrastructure),
            settings: Arc::new(settings),
            secrets: Arc::new(StaticSecretResolver),
            activities: activities.clone(),
            sweeping_outputs: outputs.clone(),
            dispatcher: dispatcher.clone(),
        });

        let orchestrator = WorkflowOrchestrator::builder(registry, services)
            .config(config)
            .store(store.clone() as Arc<dyn InstanceStore>)
            .build()
            .expect("orchestrator should build");

        Self {
            orchestrator,
            dispatcher,
            tasks,
            activities,
            outputs,
            store,
        }
    }

    /// Next task handed to the executor pool
    pub async fn next_task(&mut self) -> RemoteTask {
        tokio::time::timeout(Duration::from_secs(5), self.tasks.recv())
            .await
            .expect("a task should have been queued")
            .expect("dispatcher channel open")
    }

    pub fn no_task_queued(&mut self) -> bool {
        self.tasks.try_recv().is_err()
    }

    pub async fn instances(&self, workflow_execution_id: &str) -> Vec<StateExecutionInstance> {
        self.orchestrator
            .instances(workflow_execution_id)
            .await
            .expect("instances should load")
    }

    /// Latest instance of a state within an execution
    pub async fn instance_named(
        &self,
        workflow_execution_id: &str,
        state_name: &str,
    ) -> StateExecutionInstance {
        self.instances(workflow_execution_id)
            .await
            .into_iter()
            .filter(|instance| instance.state_name == state_name)
            .max_by_key(|instance| instance.created_at)
            .unwrap_or_else(|| panic!("no instance named {state_name}"))
    }

    /// Poll until every instance of the execution is terminal
    pub async fn settled(&self, workflow_execution_id: &str) -> Vec<StateExecutionInstance> {
        for _ in 0..200 {
            let instances = self.instances(workflow_execution_id).await;
            if instances.iter().all(StateExecutionInstance::is_terminal) {
                return instances;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {workflow_execution_id} did not settle");
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        dispatcher: DispatcherConfig {
            channel_capacity: 64,
            enqueue_timeout_ms: 1_000,
            history_limit: 100,
        },
        ..EngineConfig::default()
    }
}

pub fn phase_element() -> ContextElement {
    ContextElement::Phase(PhaseElement {
        phase_name: "deploy-web".to_string(),
        service_id: "svc-web".to_string(),
        infra_mapping_id: INFRA_MAPPING_ID.to_string(),
        deployment_type: "AMI".to_string(),
        rollback: false,
        phase_name_for_rollback: None,
    })
}

pub fn artifact_element(build_no: &str) -> ContextElement {
    ContextElement::Artifact(ArtifactElement {
        artifact_id: "artifact-1".to_string(),
        build_no: build_no.to_string(),
        source: None,
    })
}

/// Setup for a rolling deployment from one old group of `old` hosts to `desired` new ones
pub fn setup_element(old: u32, desired: u32) -> ContextElement {
    ContextElement::ServiceSetup(ServiceSetupElement {
        new_group: GroupCapacity {
            name: "web-v2".to_string(),
            desired: 0,
        },
        old_groups: vec![GroupCapacity {
            name: "web-v1".to_string(),
            desired: old,
        }],
        desired_instances: desired,
        resize_new_first: true,
        blue_green: false,
        listener: None,
    })
}

pub fn host(index: usize) -> InstanceElement {
    InstanceElement {
        instance_id: format!("i-{index:04}"),
        host_name: format!("web-{index}.internal"),
        group_name: Some("web-v2".to_string()),
        new_instance: false,
    }
}

pub fn hosts_element(count: usize) -> ContextElement {
    ContextElement::InstanceList(InstanceListElement {
        instances: (1..=count).map(host).collect(),
    })
}

/// Arguments for a deployment execution scoped to the seeded phase
pub fn deploy_args(workflow_execution_id: &str) -> ExecutionArgs {
    ExecutionArgs::new(APP_ID, ACCOUNT_ID)
        .with_execution_id(workflow_execution_id)
        .with_element(phase_element())
}

pub fn assert_status(instance: &StateExecutionInstance, status: ExecutionStatus) {
    assert_eq!(
        instance.status, status,
        "{} ended {} ({:?})",
        instance.state_name, instance.status, instance.error_message
    );
}
