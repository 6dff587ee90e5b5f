use crate::common::*;
use std::time::Duration;
use stepwise_core::constants::ROLLBACK_COMPLETED_MARKER;
use stepwise_core::models::{RemoteTaskResponse, TaskType};
use stepwise_core::orchestration::{WorkflowDefinition, WorkflowRegistry};
use stepwise_core::services::{SweepingOutputKey, SweepingOutputScope, SweepingOutputStore};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::states::{RemoteCallState, ResizeAsgStrategy, RollbackOnce};

/// Two rollback phases that both reach the cluster-wide resize rollback
fn rollback_registry() -> WorkflowRegistry {
    let rollback = |name: &str| {
        RemoteCallState::new(name, ResizeAsgStrategy::rollback(), Duration::from_secs(600))
            .rollback_once(RollbackOnce::default())
    };
    WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("rollback")
                .state(rollback("rollback_phase_1"))
                .state(rollback("rollback_phase_2"))
                .on_success("rollback_phase_1", "rollback_phase_2")
                .on_failure("rollback_phase_1", "rollback_phase_2")
                .build()
                .unwrap(),
        )
        .unwrap()
}

#[tokio::test]
async fn test_second_rollback_phase_short_circuits() {
    let mut engine = TestEngine::new(rollback_registry());

    let mut handle = engine
        .orchestrator
        .start_execution(
            "rollback",
            deploy_args("wf-rollback-once").with_element(setup_element(2, 2)),
        )
        .await
        .unwrap();

    let task = engine.next_task().await;
    assert_eq!(task.task_type, TaskType::AsgResize);
    assert_eq!(task.parameters["rollback"], true);
    engine
        .orchestrator
        .deliver(&task.wait_id, RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    assert!(engine.no_task_queued());
    assert_eq!(engine.dispatcher.stats().queued, 1);

    let second = engine.instance_named("wf-rollback-once", "rollback_phase_2").await;
    assert_status(&second, ExecutionStatus::Success);
    let data = second.state_execution_data.unwrap();
    assert_eq!(data.payload["short_circuited_by"], ROLLBACK_COMPLETED_MARKER);

    let marker = engine
        .outputs
        .find(&SweepingOutputKey::new(
            SweepingOutputScope::workflow("wf-rollback-once"),
            ROLLBACK_COMPLETED_MARKER,
        ))
        .await
        .unwrap()
        .expect("marker should be saved");
    let marker = marker.as_rollback_marker().unwrap();
    assert!(marker.completed);
    assert_eq!(marker.phase_name.as_deref(), Some("deploy-web"));
}

#[tokio::test]
async fn test_failed_rollback_does_not_short_circuit_the_next_phase() {
    let mut engine = TestEngine::new(rollback_registry());

    let mut handle = engine
        .orchestrator
        .start_execution(
            "rollback",
            deploy_args("wf-rollback-retry").with_element(setup_element(2, 2)),
        )
        .await
        .unwrap();

    let first = engine.next_task().await;
    engine
        .orchestrator
        .deliver(&first.wait_id, RemoteTaskResponse::failure("ValidationError: group busy"))
        .await
        .unwrap();

    // The next phase still has to run the rollback itself
    let second = engine.next_task().await;
    engine
        .orchestrator
        .deliver(&second.wait_id, RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(engine.dispatcher.stats().queued, 2);
    assert_eq!(engine.outputs.len(), 1);
}

#[tokio::test]
async fn test_marker_is_scoped_to_one_execution() {
    let mut engine = TestEngine::new(rollback_registry());

    for id in ["wf-first", "wf-second"] {
        let mut handle = engine
            .orchestrator
            .start_execution("rollback", deploy_args(id).with_element(setup_element(1, 1)))
            .await
            .unwrap();
        let task = engine.next_task().await;
        engine
            .orchestrator
            .deliver(&task.wait_id, RemoteTaskResponse::success(serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    }

    assert_eq!(engine.dispatcher.stats().queued, 2);
    assert_eq!(engine.outputs.len(), 2);
}
