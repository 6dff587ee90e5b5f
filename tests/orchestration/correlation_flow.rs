use crate::common::*;
use stepwise_core::correlation::DeliveryOutcome;
use stepwise_core::events::EngineEvent;
use stepwise_core::models::RemoteTaskResponse;
use stepwise_core::orchestration::{WorkflowDefinition, WorkflowRegistry};
use stepwise_core::state_machine::ExecutionStatus;
use stepwise_core::EngineError;

fn single_state_registry(state: AwaitTokens) -> WorkflowRegistry {
    WorkflowRegistry::new()
        .with(WorkflowDefinition::builder("deploy").state(state).build().unwrap())
        .unwrap()
}

#[tokio::test]
async fn test_batch_resumes_once_after_every_token() {
    let state = AwaitTokens::new("batch", &["W1", "W2", "W3"]);
    let resumes = state.resumes.clone();
    let mut engine = TestEngine::new(single_state_registry(state));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-batch"))
        .await
        .unwrap();

    let mut queued = Vec::new();
    for _ in 0..3 {
        queued.push(engine.next_task().await.wait_id);
    }
    assert_eq!(queued, vec!["W1", "W2", "W3"]);

    for token in ["W1", "W2"] {
        let outcome = engine
            .orchestrator
            .deliver(token, RemoteTaskResponse::success(serde_json::json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Pending { .. }));
    }
    assert!(resumes.lock().is_empty());
    let running = engine.instance_named("wf-batch", "batch").await;
    assert_status(&running, ExecutionStatus::Running);
    assert!(handle.outcome().is_none());

    let outcome = engine
        .orchestrator
        .deliver("W3", RemoteTaskResponse::success(serde_json::json!({})))
        .await
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Satisfied(_)));

    let resumes = resumes.lock().clone();
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0], vec!["W1", "W2", "W3"]);
    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_wait_for_any_rejects_a_repeated_sibling_token() {
    let state = AwaitTokens::new("race", &["A", "B"]).any();
    let resumes = state.resumes.clone();
    let mut engine = TestEngine::new(single_state_registry(state));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-any"))
        .await
        .unwrap();
    engine.next_task().await;
    engine.next_task().await;

    let first = engine
        .orchestrator
        .deliver("B", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert!(matches!(first, DeliveryOutcome::Satisfied(_)));
    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    assert_eq!(resumes.lock().clone(), vec![vec!["B".to_string()]]);

    // The losing sibling is dropped once, then treated like any redelivery
    let sibling = engine
        .orchestrator
        .deliver("A", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert!(matches!(sibling, DeliveryOutcome::Ignored));

    let err = engine
        .orchestrator
        .deliver("A", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, EngineError::Correlation(_)));
    assert_eq!(resumes.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retired_tokens_are_swept_after_retention() {
    let mut config = test_config();
    config.orchestrator.consumed_token_retention_secs = 0;
    config.orchestrator.token_sweep_interval_secs = 1;
    let mut engine = TestEngine::with_config(
        single_state_registry(AwaitTokens::new("pair", &["A", "B"]).any()),
        config,
    );

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-sweep"))
        .await
        .unwrap();
    engine.next_task().await;
    engine
        .orchestrator
        .deliver("A", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
    // A consumed, B superseded
    assert_eq!(engine.orchestrator.correlation().token_count(), 2);

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert_eq!(engine.orchestrator.correlation().token_count(), 0);
}

#[tokio::test]
async fn test_failed_response_fails_the_workflow_with_its_message() {
    let mut engine = TestEngine::new(single_state_registry(AwaitTokens::new("step", &["W1"])));
    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-fail"))
        .await
        .unwrap();
    engine.next_task().await;

    engine
        .orchestrator
        .deliver("W1", RemoteTaskResponse::failure("AccessDenied: not authorized"))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.error_message.as_deref(), Some("AccessDenied: not authorized"));
}

#[tokio::test]
async fn test_duplicate_delivery_is_fatal() {
    let mut engine = TestEngine::new(single_state_registry(AwaitTokens::new("step", &["W1"])));
    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-dup"))
        .await
        .unwrap();
    engine.next_task().await;

    engine
        .orchestrator
        .deliver("W1", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);

    let err = engine
        .orchestrator
        .deliver("W1", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, EngineError::Correlation(_)));
}

#[tokio::test]
async fn test_response_arriving_before_suspend_is_parked() {
    let mut engine = TestEngine::new(single_state_registry(AwaitTokens::new("early", &["W9"])));

    let parked = engine
        .orchestrator
        .deliver("W9", RemoteTaskResponse::success(serde_json::Value::Null))
        .await
        .unwrap();
    assert!(matches!(parked, DeliveryOutcome::Parked));

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-early"))
        .await
        .unwrap();
    engine.next_task().await;

    assert_eq!(handle.wait().await.unwrap().status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_suspend_publishes_start_and_suspend_transitions() {
    let mut engine = TestEngine::new(single_state_registry(AwaitTokens::new("pair", &["A", "B"])));
    let mut events = engine.orchestrator.subscribe();

    engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-events"))
        .await
        .unwrap();
    engine.next_task().await;

    let mut seen = Vec::new();
    while let Ok(published) = events.try_recv() {
        if let EngineEvent::InstanceTransitioned { from, to, event, .. } = published.event {
            seen.push((from, to, event.event_type()));
        }
    }
    assert_eq!(
        seen,
        vec![
            (ExecutionStatus::New, ExecutionStatus::Running, "start"),
            (ExecutionStatus::Running, ExecutionStatus::Running, "suspend"),
        ]
    );
}

#[tokio::test]
async fn test_panicking_state_ends_with_error() {
    let registry = WorkflowRegistry::new()
        .with(
            WorkflowDefinition::builder("deploy")
                .state(Explode("boom"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let engine = TestEngine::new(registry);

    let mut handle = engine
        .orchestrator
        .start_execution("deploy", deploy_args("wf-panic"))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Error);
    assert!(outcome.error_message.unwrap().contains("disk full"));
}

#[tokio::test]
async fn test_unknown_workflow_is_rejected() {
    let engine = TestEngine::new(WorkflowRegistry::new());
    let err = engine
        .orchestrator
        .start_execution("missing", deploy_args("wf-missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownWorkflow(ref id) if id == "missing"));
}
