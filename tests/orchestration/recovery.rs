use crate::common::*;
use std::sync::Arc;
use stepwise_core::correlation::DeliveryOutcome;
use stepwise_core::models::{RemoteTaskResponse, StateExecutionInstance, StateType};
use stepwise_core::orchestration::{RecoveryReport, WorkflowDefinition, WorkflowRegistry};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::store::{InMemoryInstanceStore, InstanceStore};

fn registry() -> WorkflowRegistry {
    WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(AwaitTokens::new("resize", &["W1"]))
                .state(Finish::success("verify"))
                .on_success("resize", "verify")
                .build()
                .unwrap(),
        )
        .unwrap()
}

#[tokio::test]
async fn test_recover_rearms_suspended_instance() {
    let store = Arc::new(InMemoryInstanceStore::new());

    let mut before = TestEngine::with_store(registry(), test_config(), store.clone());
    before
        .orchestrator
        .start_execution("deploy", deploy_args("wf-restart"))
        .await
        .unwrap();
    before.next_task().await;
    drop(before);

    let after = TestEngine::with_store(registry(), test_config(), store.clone());
    let report = after.orchestrator.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            rearmed: 1,
            ..RecoveryReport::default()
        }
    );
    assert!(after.orchestrator.correlation().pending_count() > 0);

    after
        .orchestrator
        .deliver("W1", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();

    let instances = after.settled("wf-restart").await;
    assert_eq!(instances.len(), 2);
    for instance in &instances {
        assert_status(instance, ExecutionStatus::Success);
    }
}

fn batch_registry(state: AwaitTokens) -> WorkflowRegistry {
    WorkflowRegistry::new()
        .with(WorkflowDefinition::builder("deploy").state(state).build().unwrap())
        .unwrap()
}

#[tokio::test]
async fn test_recover_keeps_responses_delivered_before_the_restart() {
    let store = Arc::new(InMemoryInstanceStore::new());

    let mut before = TestEngine::with_store(
        batch_registry(AwaitTokens::new("batch", &["W1", "W2", "W3"])),
        test_config(),
        store.clone(),
    );
    before
        .orchestrator
        .start_execution("deploy", deploy_args("wf-partial"))
        .await
        .unwrap();
    for _ in 0..3 {
        before.next_task().await;
    }
    for token in ["W1", "W2"] {
        before
            .orchestrator
            .deliver(token, RemoteTaskResponse::success(serde_json::Value::Null))
            .await
            .unwrap();
    }
    let suspended = before.instance_named("wf-partial", "batch").await;
    let received: Vec<_> = suspended
        .pending_wait
        .unwrap()
        .received
        .into_iter()
        .map(|received| received.token)
        .collect();
    assert_eq!(received, vec!["W1", "W2"]);
    drop(before);

    let state = AwaitTokens::new("batch", &["W1", "W2", "W3"]);
    let resumes = state.resumes.clone();
    let after = TestEngine::with_store(batch_registry(state), test_config(), store);
    assert_eq!(after.orchestrator.recover().await.unwrap().rearmed, 1);

    // Already received before the restart
    let err = after
        .orchestrator
        .deliver("W2", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_fatal());

    let outcome = after
        .orchestrator
        .deliver("W3", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Satisfied(_)));

    let instances = after.settled("wf-partial").await;
    assert_eq!(instances.len(), 1);
    assert_status(&instances[0], ExecutionStatus::Success);
    assert_eq!(resumes.lock().clone(), vec![vec!["W1", "W2", "W3"]]);
}

#[tokio::test]
async fn test_recover_aborts_instance_caught_mid_execution() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let mut orphan =
        StateExecutionInstance::new("wf-orphan", APP_ID, ACCOUNT_ID, "deploy", "resize", StateType::Custom);
    orphan.status = ExecutionStatus::Running;
    let orphan_id = orphan.id;
    store.insert(orphan).await.unwrap();

    let engine = TestEngine::with_store(registry(), test_config(), store);
    let report = engine.orchestrator.recover().await.unwrap();
    assert_eq!(report.aborted, 1);

    let instance = engine.orchestrator.instance(orphan_id).await.unwrap();
    assert_status(&instance, ExecutionStatus::Failed);
    assert!(instance.error_message.unwrap().starts_with("Aborted after"));
    // A failed resize has no failure edge, so nothing else runs
    assert_eq!(engine.instances("wf-orphan").await.len(), 1);
}

#[tokio::test]
async fn test_recover_completes_interrupted_abort_and_starts_new_instances() {
    let store = Arc::new(InMemoryInstanceStore::new());

    let mut aborting =
        StateExecutionInstance::new("wf-aborting", APP_ID, ACCOUNT_ID, "deploy", "resize", StateType::Custom);
    aborting.status = ExecutionStatus::Aborting;
    let aborting_id = aborting.id;
    store.insert(aborting).await.unwrap();

    let fresh =
        StateExecutionInstance::new("wf-fresh", APP_ID, ACCOUNT_ID, "deploy", "verify", StateType::Custom);
    let fresh_id = fresh.id;
    store.insert(fresh).await.unwrap();

    let engine = TestEngine::with_store(registry(), test_config(), store);
    let report = engine.orchestrator.recover().await.unwrap();
    assert_eq!(report.completed_aborts, 1);
    assert_eq!(report.started, 1);

    assert_status(
        &engine.orchestrator.instance(aborting_id).await.unwrap(),
        ExecutionStatus::Failed,
    );
    assert_status(
        &engine.orchestrator.instance(fresh_id).await.unwrap(),
        ExecutionStatus::Success,
    );
}

#[tokio::test]
async fn test_trigger_execution_runs_a_prepared_instance() {
    let engine = TestEngine::new(registry());
    let prepared = StateExecutionInstance::new(
        "wf-triggered",
        APP_ID,
        ACCOUNT_ID,
        "deploy",
        "verify",
        StateType::Custom,
    );
    let prepared_id = prepared.id;

    engine.orchestrator.trigger_execution(prepared).await.unwrap();
    assert_status(
        &engine.orchestrator.instance(prepared_id).await.unwrap(),
        ExecutionStatus::Success,
    );

    let mut running = StateExecutionInstance::new(
        "wf-triggered",
        APP_ID,
        ACCOUNT_ID,
        "deploy",
        "verify",
        StateType::Custom,
    );
    running.status = ExecutionStatus::Running;
    assert!(engine.orchestrator.trigger_execution(running).await.is_err());
}
