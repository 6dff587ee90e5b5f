use crate::common::*;
use std::time::Duration;
use stepwise_core::models::{
    ContextElement, ListenerTarget, RemoteTaskResponse, ServiceSetupElement, TaskType,
};
use stepwise_core::orchestration::{ExecutionArgs, WorkflowDefinition, WorkflowRegistry};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::states::{
    HostBatchStrategy, InstanceUnitType, ListenerAction, ListenerUpdateStrategy, RemoteCallState,
    ResizeAsgStrategy, SteadyStateStrategy, CAPACITY_PARAM,
};

const LEAF_TIMEOUT: Duration = Duration::from_secs(600);

fn registry(definition: WorkflowDefinition) -> WorkflowRegistry {
    WorkflowRegistry::new().with(definition).unwrap()
}

fn with_elements(id: &str, elements: Vec<ContextElement>) -> ExecutionArgs {
    elements
        .into_iter()
        .fold(deploy_args(id), ExecutionArgs::with_element)
}

#[tokio::test]
async fn test_host_batch_runs_under_the_resolved_target_and_closes_its_activity() {
    let definition = WorkflowDefinition::builder("deploy")
        .state(RemoteCallState::new(
            "install",
            HostBatchStrategy::new("install build ${artifact.build_no}", 10),
            LEAF_TIMEOUT,
        ))
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution(
            "deploy",
            with_elements("wf-install", vec![artifact_element("142"), hosts_element(3)]),
        )
        .await
        .unwrap();

    let task = engine.next_task().await;
    assert!(engine.no_task_queued());
    assert_eq!(task.task_type, TaskType::CommandExecution);
    assert_eq!(task.timeout_millis, 600_000);
    assert_eq!(task.parameters["command"], "install build 142");
    assert_eq!(task.parameters["hosts"].as_array().unwrap().len(), 3);
    assert_eq!(task.parameters["batch_count"], 1);
    assert_eq!(task.scope.app_id, APP_ID);
    assert_eq!(task.scope.env_id.as_deref(), Some("env-prod"));
    assert_eq!(task.scope.infra_mapping_id.as_deref(), Some(INFRA_MAPPING_ID));
    assert_eq!(task.encryption_details.secret_ref, "aws/aws-prod");

    let running = engine.instance_named("wf-install", "install").await;
    let data = running.state_execution_data.unwrap();
    assert_eq!(data.correlation_tokens, vec![task.wait_id.clone()]);
    assert_eq!(data.task_ids, vec![task.task_id.clone()]);

    engine
        .orchestrator
        .deliver(&task.wait_id, RemoteTaskResponse::success(serde_json::json!({"exit_code": 0})))
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    let activities = engine.activities.all();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].activity.command_name, "Execute Command");
    assert_eq!(activities[0].activity.env_id.as_deref(), Some("env-prod"));
    assert_eq!(
        activities[0].status_history,
        vec![ExecutionStatus::Running, ExecutionStatus::Success]
    );
}

#[tokio::test]
async fn test_resized_hosts_feed_the_next_host_batch() {
    let capture = Capture::new("verify");
    let hosts_seen = capture.hosts_seen.clone();
    let definition = WorkflowDefinition::builder("deploy")
        .state(RemoteCallState::new(
            "resize",
            ResizeAsgStrategy::new(2, InstanceUnitType::Count),
            LEAF_TIMEOUT,
        ))
        .state(RemoteCallState::new(
            "install",
            HostBatchStrategy::new("systemctl restart web", 1),
            LEAF_TIMEOUT,
        ))
        .state(capture)
        .on_success("resize", "install")
        .on_success("install", "verify")
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-resize", vec![setup_element(2, 2)]))
        .await
        .unwrap();

    let resize = engine.next_task().await;
    assert_eq!(resize.task_type, TaskType::AsgResize);
    assert_eq!(resize.parameters["new_group"]["name"], "web-v2");
    assert_eq!(resize.parameters["new_group"]["desired"], 2);
    assert_eq!(resize.parameters["old_groups"][0]["desired"], 0);
    assert_eq!(resize.parameters["region"], "us-east-1");

    // The executor reports one more host than was asked for
    let launched = serde_json::to_value(vec![host(1), host(2), host(3)]).unwrap();
    engine
        .orchestrator
        .deliver(
            &resize.wait_id,
            RemoteTaskResponse::success(serde_json::json!({ "instances": launched })),
        )
        .await
        .unwrap();

    let first = engine.next_task().await;
    let second = engine.next_task().await;
    assert!(engine.no_task_queued());
    assert_eq!(first.parameters["hosts"], serde_json::json!(["web-1.internal"]));
    assert_eq!(second.parameters["hosts"], serde_json::json!(["web-2.internal"]));
    assert_eq!(second.parameters["batch_count"], 2);

    for task in [first, second] {
        engine
            .orchestrator
            .deliver(&task.wait_id, RemoteTaskResponse::success(serde_json::Value::Null))
            .await
            .unwrap();
    }

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    assert_eq!(hosts_seen.lock().clone(), vec![2]);

    let resized = engine.instance_named("wf-resize", "resize").await;
    let capacities = resized
        .context_elements
        .iter()
        .find_map(|element| match element {
            ContextElement::Param { name, value } if name == CAPACITY_PARAM => Some(value.clone()),
            _ => None,
        })
        .expect("capacities should be published");
    assert_eq!(capacities["new_group"]["desired"], 2);
}

#[tokio::test]
async fn test_transient_failure_is_requeued_under_a_new_token() {
    let definition = WorkflowDefinition::builder("deploy")
        .state(RemoteCallState::new(
            "install",
            HostBatchStrategy::new("install", 5),
            LEAF_TIMEOUT,
        ))
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-requeue", vec![hosts_element(2)]))
        .await
        .unwrap();

    let first = engine.next_task().await;
    engine
        .orchestrator
        .deliver(&first.wait_id, RemoteTaskResponse::transient_failure("Throttling: rate exceeded"))
        .await
        .unwrap();

    let retry = engine.next_task().await;
    assert_ne!(retry.wait_id, first.wait_id);
    assert_eq!(retry.parameters, first.parameters);
    assert!(handle.outcome().is_none());

    engine
        .orchestrator
        .deliver(&retry.wait_id, RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    let install = engine.instance_named("wf-requeue", "install").await;
    assert_eq!(install.state_execution_data.unwrap().task_ids.len(), 2);
}

#[tokio::test]
async fn test_transient_failure_fails_once_requeues_are_exhausted() {
    let definition = WorkflowDefinition::builder("deploy")
        .state(
            RemoteCallState::new("install", HostBatchStrategy::new("install", 5), LEAF_TIMEOUT)
                .max_transient_requeues(0),
        )
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-no-requeue", vec![hosts_element(1)]))
        .await
        .unwrap();

    let task = engine.next_task().await;
    engine
        .orchestrator
        .deliver(&task.wait_id, RemoteTaskResponse::transient_failure("Throttling: rate exceeded"))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("batch_1: Throttling: rate exceeded")
    );
    assert!(engine.no_task_queued());
    assert_eq!(
        engine.activities.all()[0].status_history,
        vec![ExecutionStatus::Running, ExecutionStatus::Failed]
    );
}

#[tokio::test]
async fn test_disabled_state_is_skipped_without_dispatching() {
    let definition = WorkflowDefinition::builder("deploy")
        .state(
            RemoteCallState::new("install", HostBatchStrategy::new("install", 5), LEAF_TIMEOUT)
                .disabled(true),
        )
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-disabled", vec![hosts_element(1)]))
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Skipped);
    assert!(engine.no_task_queued());
    assert!(engine.activities.all().is_empty());
    let install = engine.instance_named("wf-disabled", "install").await;
    assert_eq!(install.error_message.as_deref(), Some("install is disabled"));
}

#[tokio::test]
async fn test_steady_state_publishes_the_container_service() {
    let capture = Capture::new("report")
        .rendering("${service.service_name} ${service.running_count}/${service.desired_count}");
    let rendered = capture.rendered.clone();
    let definition = WorkflowDefinition::builder("deploy")
        .state(RemoteCallState::new(
            "steady",
            SteadyStateStrategy::default(),
            Duration::from_secs(1_800),
        ))
        .state(capture)
        .on_success("steady", "report")
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-steady", vec![setup_element(2, 3)]))
        .await
        .unwrap();

    let task = engine.next_task().await;
    assert_eq!(task.task_type, TaskType::SteadyStateCheck);
    assert_eq!(task.parameters["cluster_name"], "prod-cluster");
    assert_eq!(task.parameters["service_name"], "web-v2");
    assert_eq!(task.parameters["desired_count"], 3);

    engine
        .orchestrator
        .deliver(&task.wait_id, RemoteTaskResponse::success(serde_json::json!({"running_count": 3})))
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    assert_eq!(rendered.lock().clone(), vec!["web-v2 3/3".to_string()]);
}

fn listener_setup() -> ContextElement {
    let ContextElement::ServiceSetup(setup) = setup_element(2, 2) else {
        unreachable!("setup_element builds a service setup");
    };
    ContextElement::ServiceSetup(ServiceSetupElement {
        listener: Some(ListenerTarget {
            listener_id: "lst-1".to_string(),
            old_target_group: "tg-blue".to_string(),
            new_target_group: "tg-green".to_string(),
            stage_target_group: None,
        }),
        ..setup
    })
}

#[tokio::test]
async fn test_traffic_shift_publishes_the_new_weight() {
    let capture = Capture::new("report").rendering("${new_target_weight}");
    let rendered = capture.rendered.clone();
    let definition = WorkflowDefinition::builder("deploy")
        .state(RemoteCallState::new(
            "shift",
            ListenerUpdateStrategy::new(ListenerAction::ShiftTraffic { new_weight: 30 }),
            LEAF_TIMEOUT,
        ))
        .state(capture)
        .on_success("shift", "report")
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-shift", vec![listener_setup()]))
        .await
        .unwrap();

    let task = engine.next_task().await;
    assert_eq!(task.task_type, TaskType::ListenerUpdate);
    assert_eq!(task.parameters["listener_id"], "lst-1");
    assert_eq!(task.parameters["new_weight"], 30);
    assert_eq!(task.parameters["old_weight"], 70);

    engine
        .orchestrator
        .deliver(&task.wait_id, RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    assert_eq!(rendered.lock().clone(), vec!["30".to_string()]);
}

#[tokio::test]
async fn test_listener_update_without_listener_is_a_configuration_error() {
    let definition = WorkflowDefinition::builder("deploy")
        .state(RemoteCallState::new(
            "swap",
            ListenerUpdateStrategy::new(ListenerAction::Swap),
            LEAF_TIMEOUT,
        ))
        .build()
        .unwrap();
    let mut engine = TestEngine::new(registry(definition));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", with_elements("wf-no-listener", vec![setup_element(1, 1)]))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Error);
    assert_eq!(outcome.error_message.as_deref(), Some("No listener configured for web-v2"));
    assert!(engine.no_task_queued());
}
