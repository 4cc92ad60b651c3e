use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scheduler_dispatcher::state_manager::TaskStateChange;
use scheduler_dispatcher::{StateManager, TaskTransition};
use scheduler_domain::{
    event_types, is_valid_experiment_transition, is_valid_task_transition,
    is_valid_worker_transition, ExperimentRepository, ExperimentStatus, Metadata, TaskRepository,
    TaskStatus, Worker, WorkerRepository, WorkerStatus,
};
use scheduler_errors::SchedulerError;
use scheduler_infrastructure::InMemoryRepository;
use scheduler_testing_utils::{ExperimentBuilder, RecordingEventPublisher, TaskBuilder, WorkerBuilder};

fn setup() -> (Arc<InMemoryRepository>, RecordingEventPublisher, StateManager) {
    let repo = Arc::new(InMemoryRepository::new());
    let events = RecordingEventPublisher::new();
    let manager = StateManager::new(repo.clone(), Arc::new(events.clone()));
    (repo, events, manager)
}

#[tokio::test]
async fn test_every_task_transition_pair() {
    let (repo, _, manager) = setup();

    for from in TaskStatus::ALL {
        for to in TaskStatus::ALL {
            let id = format!("task-{}-{}", from, to);
            repo.create_task(&TaskBuilder::new("exp-1").with_id(&id).with_status(*from).build())
                .await
                .unwrap();

            let result = manager
                .transition_task_state(&id, *from, *to, Metadata::new())
                .await;
            let stored = repo.get_task(&id).await.unwrap().unwrap();

            if is_valid_task_transition(*from, *to) {
                assert!(result.is_ok(), "{} -> {} 应当成功: {:?}", from, to, result.err());
                assert_eq!(stored.status, *to);
            } else {
                assert!(
                    matches!(result, Err(SchedulerError::InvalidTransition { .. })),
                    "{} -> {} 应当被拒绝",
                    from,
                    to
                );
                assert_eq!(stored.status, *from);
            }
        }
    }
}

#[tokio::test]
async fn test_every_worker_transition_pair() {
    let (repo, _, manager) = setup();

    for from in WorkerStatus::ALL {
        for to in WorkerStatus::ALL {
            let id = format!("worker-{}-{}", from, to);
            let mut worker = Worker::new(&id, "r-1", "exp-1");
            worker.status = *from;
            worker.current_task_id = Some("t-1".to_string());
            repo.create_worker(&worker).await.unwrap();

            let result = manager
                .transition_worker_state(&id, *from, *to, Metadata::new())
                .await;
            let stored = repo.get_worker(&id).await.unwrap().unwrap();

            if is_valid_worker_transition(*from, *to) {
                assert!(result.is_ok(), "{} -> {} 应当成功", from, to);
                assert_eq!(stored.status, *to);
                if *to != WorkerStatus::Busy {
                    assert!(stored.current_task_id.is_none());
                }
            } else {
                assert!(result.is_err(), "{} -> {} 应当被拒绝", from, to);
                assert_eq!(stored.status, *from);
            }
        }
    }
}

#[tokio::test]
async fn test_every_experiment_transition_pair() {
    let (repo, _, manager) = setup();

    for from in ExperimentStatus::ALL {
        for to in ExperimentStatus::ALL {
            let id = format!("exp-{}-{}", from, to);
            repo.create_experiment(&ExperimentBuilder::new(&id).with_id(&id).with_status(*from).build())
                .await
                .unwrap();

            let result = manager
                .transition_experiment_state(&id, *from, *to, Metadata::new())
                .await;
            let stored = repo.get_experiment(&id).await.unwrap().unwrap();

            if is_valid_experiment_transition(*from, *to) {
                assert!(result.is_ok(), "{} -> {} 应当成功", from, to);
                assert_eq!(stored.status, *to);
            } else {
                assert!(result.is_err(), "{} -> {} 应当被拒绝", from, to);
                assert_eq!(stored.status, *from);
            }
        }
    }
}

#[tokio::test]
async fn test_stale_expected_state_is_rejected() {
    let (repo, events, manager) = setup();
    repo.create_task(&TaskBuilder::new("exp-1").with_id("t-1").queued().build())
        .await
        .unwrap();

    let result = manager
        .transition_task_state("t-1", TaskStatus::Created, TaskStatus::Queued, Metadata::new())
        .await;
    assert!(matches!(result, Err(SchedulerError::StateMismatch { .. })));
    assert_eq!(repo.get_task("t-1").await.unwrap().unwrap().status, TaskStatus::Queued);
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn test_transition_records_timestamps_and_event() {
    let (repo, events, manager) = setup();
    repo.create_task(
        &TaskBuilder::new("exp-1")
            .with_id("t-1")
            .queued()
            .on_resource("r-1")
            .build(),
    )
    .await
    .unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("reason".to_string(), serde_json::json!("test"));
    let running = manager
        .transition_task_state("t-1", TaskStatus::Queued, TaskStatus::Running, metadata)
        .await
        .unwrap();
    assert!(running.started_at.is_some());
    assert_eq!(running.metadata["reason"], serde_json::json!("test"));

    let done = manager
        .transition_task_state("t-1", TaskStatus::Running, TaskStatus::Completed, Metadata::new())
        .await
        .unwrap();
    assert!(done.completed_at.is_some());
    assert!(done.duration_ms.is_some());
    assert_eq!(events.count_of(event_types::TASK_STATE_CHANGED), 2);
}

#[tokio::test]
async fn test_observer_errors_do_not_roll_back() {
    let (repo, events, manager) = setup();
    repo.create_task(&TaskBuilder::new("exp-1").with_id("t-1").build())
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager
        .on_task_state_change(Arc::new(|_: &TaskStateChange| Err(SchedulerError::Internal("observer".into()))))
        .await;
    manager
        .on_task_state_change(Arc::new(move |change: &TaskStateChange| {
            assert_eq!(change.to, TaskStatus::Queued);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await;
    events.fail_publishes();

    manager
        .transition_task_state("t-1", TaskStatus::Created, TaskStatus::Queued, Metadata::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(repo.get_task("t-1").await.unwrap().unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_guarded_transition_reports_already_assigned() {
    let (repo, _, manager) = setup();
    repo.create_task(
        &TaskBuilder::new("exp-1")
            .with_id("t-1")
            .queued()
            .on_resource("r-1")
            .build(),
    )
    .await
    .unwrap();

    let result = manager
        .transition_task_state_with(
            "t-1",
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskTransition::new().require_resource_unassigned(),
        )
        .await;
    assert!(matches!(result, Err(SchedulerError::AlreadyAssigned { .. })));
    assert_eq!(repo.get_task("t-1").await.unwrap().unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    let (repo, _, manager) = setup();
    repo.create_task(
        &TaskBuilder::new("exp-1")
            .with_id("t-1")
            .with_status(TaskStatus::Running)
            .on_resource("r-1")
            .build(),
    )
    .await
    .unwrap();
    repo.create_worker(&WorkerBuilder::new("w-1", "r-1", "exp-1").build())
        .await
        .unwrap();
    repo.create_worker(&WorkerBuilder::new("w-2", "r-1", "exp-1").build())
        .await
        .unwrap();

    let (task, worker) = manager.claim_task_for_worker("t-1", "w-1").await.unwrap();
    assert_eq!(task.worker_id.as_deref(), Some("w-1"));
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_task_id.as_deref(), Some("t-1"));

    let second = manager.claim_task_for_worker("t-1", "w-2").await;
    assert!(matches!(second, Err(SchedulerError::AlreadyAssigned { .. })));
    assert_eq!(
        repo.get_worker("w-2").await.unwrap().unwrap().status,
        WorkerStatus::Idle
    );

    let busy = manager.claim_task_for_worker("t-1", "w-1").await;
    assert!(matches!(busy, Err(SchedulerError::WorkerUnavailable { .. })));
}

#[tokio::test]
async fn test_release_claim_restores_task_and_worker() {
    let (repo, _, manager) = setup();
    repo.create_task(
        &TaskBuilder::new("exp-1")
            .with_id("t-1")
            .with_status(TaskStatus::Running)
            .on_resource("r-1")
            .build(),
    )
    .await
    .unwrap();
    repo.create_worker(&WorkerBuilder::new("w-1", "r-1", "exp-1").build())
        .await
        .unwrap();

    manager.claim_task_for_worker("t-1", "w-1").await.unwrap();
    manager
        .transition_task_state_with(
            "t-1",
            TaskStatus::Running,
            TaskStatus::DataStaging,
            TaskTransition::new().with_entry("staging_operation_id", serde_json::json!("op-1")),
        )
        .await
        .unwrap();

    let other = manager.release_claim("t-1", "w-2").await;
    assert!(matches!(other, Err(SchedulerError::TaskNotAssigned { .. })));

    let task = manager.release_claim("t-1", "w-1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.worker_id.is_none());
    assert_eq!(task.compute_resource_id.as_deref(), Some("r-1"));
    assert!(!task.metadata.contains_key("staging_operation_id"));

    let worker = repo.get_worker("w-1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_task_id.is_none());
}

#[tokio::test]
async fn test_requeue_clears_assignment() {
    let (repo, _, manager) = setup();
    repo.create_task(
        &TaskBuilder::new("exp-1")
            .with_id("t-1")
            .with_status(TaskStatus::Running)
            .on_resource("r-1")
            .assigned_to("w-1")
            .build(),
    )
    .await
    .unwrap();

    let task = manager
        .requeue_task("t-1", true, Some("boom".to_string()))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.worker_id.is_none());
    assert!(task.compute_resource_id.is_none());
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.error.as_deref(), Some("boom"));
}
