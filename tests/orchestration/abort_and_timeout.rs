use crate::common::*;
use std::sync::atomic::Ordering;
use std::time::Duration;
use stepwise_core::config::ConvergencePolicy;
use stepwise_core::correlation::DeliveryOutcome;
use stepwise_core::events::EngineEvent;
use stepwise_core::models::{ContextElement, RemoteTaskResponse};
use stepwise_core::orchestration::{WorkflowDefinition, WorkflowRegistry};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::states::{ForkItems, ForkState};

#[tokio::test(start_paused = true)]
async fn test_timeout_aborts_exactly_once() {
    let state = AwaitTokens::new("wait", &["W1"]).timeout(Duration::from_secs(600));
    let aborts = state.aborts.clone();
    let registry = WorkflowRegistry::new()
        .with(WorkflowDefinition::builder("deploy").state(state).build().unwrap())
        .unwrap();
    let mut engine = TestEngine::new(registry);
    let mut events = engine.orchestrator.subscribe();

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-timeout"))
        .await
        .unwrap();
    engine.next_task().await;

    tokio::time::sleep(Duration::from_secs(601)).await;
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("wait not completed within 10m")
    );
    assert_eq!(aborts.load(Ordering::SeqCst), 1);

    let mut aborting = 0;
    while let Ok(published) = events.try_recv() {
        if let EngineEvent::InstanceTransitioned { to: ExecutionStatus::Aborting, .. } = published.event {
            aborting += 1;
        }
    }
    assert_eq!(aborting, 1);

    // The executor answering late changes nothing
    let late = engine
        .orchestrator
        .deliver("W1", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert!(matches!(late, DeliveryOutcome::Ignored));
    let instance = engine.instance_named("wf-timeout", "wait").await;
    assert_status(&instance, ExecutionStatus::Failed);
    assert!(instance.pending_wait.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_response_before_deadline_disarms_timeout() {
    let registry = WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(AwaitTokens::new("wait", &["W1"]).timeout(Duration::from_secs(30)))
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut engine = TestEngine::new(registry);

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-in-time"))
        .await
        .unwrap();
    engine.next_task().await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    engine
        .orchestrator
        .deliver("W1", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_manual_abort_cascades_to_fork_branches() {
    let branch = AwaitTokens::from_param("task", "branch");
    let branch_aborts = branch.aborts.clone();
    let registry = WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(ForkState::new(
                    "step",
                    "branch",
                    ForkItems::Static(vec![
                        ContextElement::param("branch", "B1"),
                        ContextElement::param("branch", "B2"),
                    ]),
                    Duration::from_secs(600),
                ))
                .build()
                .unwrap(),
        )
        .unwrap()
        .with(WorkflowDefinition::builder("branch").state(branch).build().unwrap())
        .unwrap();
    let mut engine = TestEngine::new(registry);

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-cascade"))
        .await
        .unwrap();
    engine.next_task().await;
    engine.next_task().await;

    engine.orchestrator.abort(handle.root_instance_id()).await.unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.error_message.unwrap().starts_with("Aborted after"));

    let instances = engine.settled("wf-cascade").await;
    assert_eq!(instances.len(), 3);
    for instance in &instances {
        assert_status(instance, ExecutionStatus::Failed);
    }
    assert_eq!(branch_aborts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_abort_all_starts_no_successors() {
    let registry = WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(AwaitTokens::new("resize", &["W1"]))
                .state(Finish::success("verify"))
                .on_success("resize", "verify")
                .on_failure("resize", "verify")
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut engine = TestEngine::new(registry);

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-abort-all"))
        .await
        .unwrap();
    engine.next_task().await;

    engine.orchestrator.abort_all("wf-abort-all").await.unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Failed);
    let instances = engine.instances("wf-abort-all").await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state_name, "resize");

    // Aborting a finished execution is a no-op
    engine.orchestrator.abort_all("wf-abort-all").await.unwrap();
    assert!(engine.orchestrator.abort_all("wf-unknown").await.is_err());
}

#[tokio::test]
async fn test_failure_edge_runs_rollback_but_execution_fails() {
    let registry = WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(Finish::failed("deploy", "health check failed"))
                .state(Finish::success("rollback"))
                .on_failure("deploy", "rollback")
                .build()
                .unwrap(),
        )
        .unwrap();
    let engine = TestEngine::new(registry);

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-rollback"))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.error_message.as_deref(), Some("health check failed"));

    let rollback = engine.instance_named("wf-rollback", "rollback").await;
    assert_status(&rollback, ExecutionStatus::Success);
    let deploy = engine.instance_named("wf-rollback", "deploy").await;
    assert_eq!(rollback.prev_instance_id, Some(deploy.id));
}

#[tokio::test]
async fn test_worst_of_policy_ignores_delivery_order() {
    let registry = WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(
                    ForkState::new(
                        "step",
                        "branch",
                        ForkItems::Static(vec![
                            ContextElement::param("branch", "B1"),
                            ContextElement::param("branch", "B2"),
                            ContextElement::param("branch", "B3"),
                        ]),
                        Duration::from_secs(600),
                    )
                    .with_policy(ConvergencePolicy::WorstOf),
                )
                .build()
                .unwrap(),
        )
        .unwrap()
        .with(
            WorkflowDefinition::builder("branch")
                .state(AwaitTokens::from_param("task", "branch"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut engine = TestEngine::new(registry);

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-worst"))
        .await
        .unwrap();
    for _ in 0..3 {
        engine.next_task().await;
    }

    engine
        .orchestrator
        .deliver("B3", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    engine
        .orchestrator
        .deliver("B1", RemoteTaskResponse::failure("instance refused to start"))
        .await
        .unwrap();
    engine
        .orchestrator
        .deliver("B2", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("step_1: instance refused to start")
    );
}
