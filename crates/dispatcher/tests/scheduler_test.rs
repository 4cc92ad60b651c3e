mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::Harness;
use scheduler_dispatcher::WorkerPoolPlan;
use scheduler_domain::{
    event_types, ComputeResourceType, DomainEvent, DomainEventPayload, EventBus, EventPublisher,
    ExperimentStatus, Metadata, TaskFilter, TaskRepository, TaskStatus, WorkerFilter,
    WorkerRepository, WorkerStatus,
};
use scheduler_errors::SchedulerError;
use scheduler_infrastructure::InProcessEventBus;
use scheduler_testing_utils::{
    ComputeResourceBuilder, ExperimentBuilder, TaskBuilder, TestEnv, WorkerBuilder,
};

async fn tasks_of(h: &Harness, experiment_id: &str) -> Vec<scheduler_domain::Task> {
    h.repo
        .list_tasks(&TaskFilter::for_experiment(experiment_id))
        .await
        .unwrap()
}

/// 一个EXECUTING实验、一个资源、一个空闲Worker与若干待认领任务
async fn claimable_setup(h: &Harness, task_ids: &[&str]) {
    h.add_resource(ComputeResourceBuilder::new("r-1").build()).await;
    h.add_experiment(
        ExperimentBuilder::new("exp")
            .with_id("exp-1")
            .with_status(ExperimentStatus::Executing)
            .build(),
    )
    .await;
    h.add_worker(WorkerBuilder::new("w-1", "r-1", "exp-1").build()).await;
    for id in task_ids {
        h.add_task(
            TaskBuilder::new("exp-1")
                .with_id(id)
                .with_status(TaskStatus::Running)
                .on_resource("r-1")
                .build(),
        )
        .await;
    }
}

#[tokio::test]
async fn test_four_tasks_on_single_resource() {
    let h = Harness::new();
    h.add_resource(ComputeResourceBuilder::new("r-1").with_max_workers(2).build())
        .await;
    h.add_experiment(ExperimentBuilder::new("exp").with_id("exp-1").with_seeds(4).build())
        .await;

    let plan = h.scheduler.submit_experiment("exp-1").await.unwrap();
    assert!(plan.total_workers >= 1 && plan.total_workers < 4);
    assert!(plan.workers_per_resource.get("r-1").copied().unwrap_or(0) <= 2);

    let tasks = tasks_of(&h, "exp-1").await;
    assert_eq!(tasks.len(), 4);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.compute_resource_id.as_deref(), Some("r-1"));
        assert!(task.worker_id.is_none());
    }
    assert_eq!(h.experiment("exp-1").await.status, ExperimentStatus::Executing);
    assert_eq!(h.events.count_of(event_types::TASK_QUEUED), 4);
    assert_eq!(h.events.count_of(event_types::TASK_ASSIGNED), 4);
    assert_eq!(h.events.count_of(event_types::SCHEDULING_PLAN_CREATED), 1);

    let distribution = h
        .scheduler
        .calculate_optimal_distribution("exp-1")
        .await
        .unwrap();
    assert_eq!(distribution.workers_per_resource.get("r-1"), Some(&2));
}

#[tokio::test]
async fn test_submit_without_resources_fails_cleanly() {
    let h = Harness::new();
    h.add_resource(ComputeResourceBuilder::new("r-off").inactive().build())
        .await;
    h.add_experiment(ExperimentBuilder::new("exp").with_id("exp-1").with_seeds(2).build())
        .await;

    let result = h.scheduler.submit_experiment("exp-1").await;
    assert!(matches!(result, Err(SchedulerError::NoAvailableResources(_))));
    assert_eq!(h.experiment("exp-1").await.status, ExperimentStatus::Created);
    assert!(tasks_of(&h, "exp-1").await.is_empty());
}

#[tokio::test]
async fn test_submit_requires_created_experiment() {
    let h = Harness::new();
    h.add_resource(ComputeResourceBuilder::new("r-1").build()).await;
    h.add_experiment(
        ExperimentBuilder::new("exp")
            .with_id("exp-1")
            .with_seeds(2)
            .with_status(ExperimentStatus::Executing)
            .build(),
    )
    .await;

    let result = h.scheduler.submit_experiment("exp-1").await;
    assert!(matches!(result, Err(SchedulerError::StateMismatch { .. })));
}

#[tokio::test]
async fn test_resource_choice_follows_type_and_preference() {
    let h = Harness::new();
    h.add_resource(
        ComputeResourceBuilder::new("slurm")
            .with_type(ComputeResourceType::Slurm)
            .build(),
    )
    .await;
    h.add_resource(
        ComputeResourceBuilder::new("k8s")
            .with_type(ComputeResourceType::Kubernetes)
            .build(),
    )
    .await;

    h.add_experiment(ExperimentBuilder::new("a").with_id("exp-a").with_seeds(2).build())
        .await;
    h.scheduler.submit_experiment("exp-a").await.unwrap();
    for task in tasks_of(&h, "exp-a").await {
        assert_eq!(task.compute_resource_id.as_deref(), Some("k8s"));
    }

    h.add_experiment(
        ExperimentBuilder::new("b")
            .with_id("exp-b")
            .with_seeds(2)
            .with_preferred_resource("slurm")
            .build(),
    )
    .await;
    h.scheduler.submit_experiment("exp-b").await.unwrap();
    for task in tasks_of(&h, "exp-b").await {
        assert_eq!(task.compute_resource_id.as_deref(), Some("slurm"));
    }
}

#[tokio::test]
async fn test_assign_task_never_double_assigns() {
    let h = Harness::new();
    claimable_setup(&h, &["t-1", "t-2"]).await;
    h.add_worker(WorkerBuilder::new("w-2", "r-1", "exp-1").build()).await;
    h.add_worker(WorkerBuilder::new("w-3", "r-1", "exp-1").build()).await;

    let first = h.scheduler.assign_task("w-1").await.unwrap().unwrap();
    assert_eq!(first.worker_id.as_deref(), Some("w-1"));
    let worker = h.worker("w-1").await;
    assert_eq!(worker.status, WorkerStatus::Busy);
    assert_eq!(worker.current_task_id.as_deref(), Some(first.id.as_str()));

    let again = h.scheduler.assign_task("w-1").await;
    assert!(matches!(again, Err(SchedulerError::WorkerUnavailable { .. })));

    let second = h.scheduler.assign_task("w-2").await.unwrap().unwrap();
    assert_ne!(first.id, second.id);

    assert!(h.scheduler.assign_task("w-3").await.unwrap().is_none());
    assert_eq!(h.worker("w-3").await.status, WorkerStatus::Idle);
    assert_eq!(h.events.count_of(event_types::TASK_ASSIGNED), 2);
}

#[tokio::test]
async fn test_concurrent_assignment_claims_each_task_once() {
    let h = Harness::new();
    claimable_setup(&h, &["t-1", "t-2", "t-3"]).await;
    for i in 2..=6 {
        h.add_worker(WorkerBuilder::new(&format!("w-{i}"), "r-1", "exp-1").build())
            .await;
    }

    let mut handles = Vec::new();
    for i in 1..=6 {
        let scheduler = Arc::clone(&h.scheduler);
        handles.push(tokio::spawn(async move {
            scheduler.assign_task(&format!("w-{i}")).await
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Ok(Some(task)) = handle.await.unwrap() {
            claimed.push(task.id);
        }
    }
    assert!(!claimed.is_empty() && claimed.len() <= 3);
    let mut distinct = claimed.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), claimed.len());

    let workers = h.repo.list_workers(&WorkerFilter::default()).await.unwrap();
    for task_id in &claimed {
        let holders = workers
            .iter()
            .filter(|w| w.current_task_id.as_deref() == Some(task_id.as_str()))
            .count();
        assert_eq!(holders, 1, "任务 {} 应当只被一个Worker持有", task_id);
        assert!(h.task(task_id).await.worker_id.is_some());
    }
}

#[tokio::test]
async fn test_assign_task_prefers_colocated_inputs() {
    let h = Harness::new();
    h.add_resource(ComputeResourceBuilder::new("nfs").with_name("nfs cluster").build())
        .await;
    h.add_experiment(
        ExperimentBuilder::new("exp")
            .with_id("exp-1")
            .with_status(ExperimentStatus::Executing)
            .build(),
    )
    .await;
    h.add_worker(WorkerBuilder::new("w-1", "nfs", "exp-1").build()).await;

    let now = Utc::now();
    h.add_task(
        TaskBuilder::new("exp-1")
            .with_id("remote")
            .with_status(TaskStatus::Running)
            .on_resource("nfs")
            .with_input("s3://bucket/data.h5", 4096)
            .created_at(now)
            .build(),
    )
    .await;
    h.add_task(
        TaskBuilder::new("exp-1")
            .with_id("local")
            .with_status(TaskStatus::Running)
            .on_resource("nfs")
            .with_input("/nfs/data/data.h5", 4096)
            .created_at(now)
            .build(),
    )
    .await;

    let task = h.scheduler.assign_task("w-1").await.unwrap().unwrap();
    assert_eq!(task.id, "local");
}

#[tokio::test]
async fn test_three_failures_requeue_twice_then_fail() {
    let h = Harness::new();
    claimable_setup(&h, &[]).await;
    h.add_task(
        TaskBuilder::new("exp-1")
            .with_id("t-1")
            .queued()
            .with_retries(0, 3)
            .build(),
    )
    .await;

    let mut statuses = Vec::new();
    for attempt in 1..=3 {
        assert!(h.scheduler.process_task("t-1").await.unwrap());
        let claimed = h.scheduler.assign_task("w-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "t-1");

        let task = h
            .scheduler
            .fail_task("t-1", "w-1", &format!("exit code {attempt}"))
            .await
            .unwrap();
        assert_eq!(task.retry_count, attempt);
        statuses.push(task.status);
        if task.status == TaskStatus::Failed {
            break;
        }
        assert!(task.worker_id.is_none());
        assert!(task.compute_resource_id.is_none());
        assert_eq!(h.worker("w-1").await.status, WorkerStatus::Idle);
    }

    assert_eq!(
        statuses,
        vec![TaskStatus::Queued, TaskStatus::Queued, TaskStatus::Failed]
    );
    let task = h.task("t-1").await;
    assert_eq!(task.error.as_deref(), Some("exit code 3"));
    assert!(task.retry_count <= task.max_retries);

    // 唯一的任务永久失败，实验被取消并关闭其Worker
    assert_eq!(h.experiment("exp-1").await.status, ExperimentStatus::Canceled);
    assert_eq!(h.events.count_of(event_types::EXPERIMENT_FAILED), 1);
    assert_eq!(h.worker("w-1").await.status, WorkerStatus::Terminated);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_completion_cascades_to_experiment_and_workers() {
    let h = Harness::new();
    claimable_setup(&h, &["t-1", "t-2"]).await;
    h.add_worker(WorkerBuilder::new("w-2", "r-1", "exp-1").build()).await;

    let a = h.scheduler.assign_task("w-1").await.unwrap().unwrap();
    let b = h.scheduler.assign_task("w-2").await.unwrap().unwrap();

    let done = h
        .scheduler
        .complete_task(&a.id, "w-1", Some("loss=0.12".to_string()))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result_summary.as_deref(), Some("loss=0.12"));
    assert_eq!(h.worker("w-1").await.status, WorkerStatus::Idle);
    assert_eq!(h.experiment("exp-1").await.status, ExperimentStatus::Executing);
    assert!(h.transport.calls().is_empty());

    h.scheduler.complete_task(&b.id, "w-2", None).await.unwrap();
    assert_eq!(h.experiment("exp-1").await.status, ExperimentStatus::Completed);
    assert_eq!(h.events.count_of(event_types::EXPERIMENT_COMPLETED), 1);

    let mut calls = h.transport.calls();
    calls.sort_by(|x, y| x.worker_id.cmp(&y.worker_id));
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].worker_id, "w-1");
    assert!(calls.iter().all(|c| c.graceful));
    assert_eq!(h.worker("w-1").await.status, WorkerStatus::Terminated);
    assert_eq!(h.worker("w-2").await.status, WorkerStatus::Terminated);
}

#[tokio::test]
async fn test_completion_requires_owning_worker() {
    let h = Harness::new();
    claimable_setup(&h, &["t-1"]).await;
    h.scheduler.assign_task("w-1").await.unwrap().unwrap();

    let result = h.scheduler.complete_task("t-1", "w-9", None).await;
    assert!(matches!(result, Err(SchedulerError::TaskNotAssigned { .. })));
    assert_eq!(h.task("t-1").await.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_update_task_status_reports_progress() {
    let h = Harness::new();
    claimable_setup(&h, &["t-1"]).await;
    h.scheduler.assign_task("w-1").await.unwrap().unwrap();

    let staging = h
        .scheduler
        .update_task_status("t-1", "w-1", TaskStatus::OutputStaging, Metadata::new())
        .await
        .unwrap();
    assert_eq!(staging.status, TaskStatus::OutputStaging);

    let invalid = h
        .scheduler
        .update_task_status("t-1", "w-1", TaskStatus::Queued, Metadata::new())
        .await;
    assert!(matches!(invalid, Err(SchedulerError::InvalidState(_))));

    let mut metadata = Metadata::new();
    metadata.insert("result".to_string(), serde_json::json!("ok"));
    let done = h
        .scheduler
        .update_task_status("t-1", "w-1", TaskStatus::Completed, metadata)
        .await
        .unwrap();
    assert_eq!(done.result_summary.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_worker_failure_requeues_without_retry() {
    let h = Harness::new();
    claimable_setup(&h, &["t-1"]).await;
    h.scheduler.assign_task("w-1").await.unwrap().unwrap();

    let requeued = h
        .scheduler
        .handle_worker_failure("w-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.retry_count, 0);
    assert!(requeued.worker_id.is_none());
    assert!(requeued.compute_resource_id.is_none());

    let worker = h.worker("w-1").await;
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_task_id.is_none());
    assert_eq!(h.events.count_of(event_types::WORKER_FAILED), 1);

    // 空闲Worker失效时没有需要重新入队的任务
    assert!(h.scheduler.handle_worker_failure("w-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_worker_failure_resets_worker_when_requeue_fails() {
    let (h, flaky) = Harness::flaky();
    claimable_setup(&h, &["t-1"]).await;
    h.scheduler.assign_task("w-1").await.unwrap().unwrap();

    // 重新入队的事务失败，Worker复位的事务照常执行
    flaky.fail_next_transactions(1);
    let requeued = h.scheduler.handle_worker_failure("w-1").await.unwrap();
    assert!(requeued.is_none());

    let worker = h.worker("w-1").await;
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_task_id.is_none());
    let task = h.task("t-1").await;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.worker_id.as_deref(), Some("w-1"));
    assert_eq!(h.events.count_of(event_types::WORKER_FAILED), 1);
    assert_eq!(h.events.count_of(event_types::TASK_QUEUED), 0);
}

#[tokio::test]
async fn test_worker_heartbeat_updates_metrics() {
    let h = Harness::new();
    claimable_setup(&h, &[]).await;
    let before = h.worker("w-1").await.last_heartbeat;

    let invalid = h.scheduler.update_worker_metrics("w-1", 140.0, 20.0).await;
    assert!(matches!(invalid, Err(SchedulerError::ValidationError(_))));
    let nan = h.scheduler.update_worker_metrics("w-1", f64::NAN, 20.0).await;
    assert!(nan.is_err());

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.scheduler.update_worker_metrics("w-1", 35.0, 60.0).await.unwrap();
    let worker = h.worker("w-1").await;
    assert!(worker.last_heartbeat > before);
    assert!(worker.walltime_remaining_seconds <= worker.walltime_seconds);

    let status = h.scheduler.get_worker_status("w-1").await.unwrap();
    assert_eq!(status.metrics.cpu_usage_percent, 35.0);
    assert_eq!(status.metrics.memory_usage_percent, 60.0);
    assert!(status.current_task.is_none());
    assert_eq!(h.events.count_of(event_types::WORKER_HEARTBEAT), 1);
}

#[tokio::test]
async fn test_worker_metrics_derive_from_history() {
    let h = Harness::new();
    claimable_setup(&h, &[]).await;
    for (id, status, duration) in [
        ("done-1", TaskStatus::Completed, Some(60_000)),
        ("done-2", TaskStatus::Completed, Some(120_000)),
        ("failed", TaskStatus::Failed, None),
    ] {
        let mut task = TaskBuilder::new("exp-1")
            .with_id(id)
            .with_status(status)
            .assigned_to("w-1")
            .build();
        task.duration_ms = duration;
        h.add_task(task).await;
    }

    let metrics = h.scheduler.get_worker_metrics("w-1").await.unwrap();
    assert_eq!(metrics.tasks_completed, 2);
    assert_eq!(metrics.tasks_failed, 1);
    assert_eq!(metrics.average_task_duration_ms, 90_000);
    assert_eq!(metrics.cpu_usage_percent, 0.0);
}

#[tokio::test]
async fn test_provision_worker_pool_is_idempotent() {
    let h = Harness::new();
    h.add_resource(ComputeResourceBuilder::new("r-1").build()).await;
    h.add_experiment(ExperimentBuilder::new("exp").with_id("exp-1").build())
        .await;

    let plan = WorkerPoolPlan {
        experiment_id: "exp-1".to_string(),
        workers_per_resource: HashMap::from([("r-1".to_string(), 2)]),
        total_workers: 2,
        total_tasks: 5,
        ..Default::default()
    };
    let workers = h
        .scheduler
        .provision_worker_pool("exp-1", &plan)
        .await
        .unwrap();
    assert_eq!(workers.len(), 2);
    assert!(workers.iter().all(|w| w.status == WorkerStatus::Idle));
    assert_eq!(workers[0].id, "worker-exp-1-r-1-0");
    assert_eq!(workers[0].walltime_seconds, 1800);
    assert_eq!(h.resource("r-1").await.current_workers, 2);

    let again = h
        .scheduler
        .provision_worker_pool("exp-1", &plan)
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(h.resource("r-1").await.current_workers, 2);
}

#[tokio::test]
async fn test_queued_event_triggers_resource_assignment() {
    let bus = Arc::new(InProcessEventBus::new());
    let h = Harness::with_publisher(bus.clone());
    bus.subscribe(event_types::TASK_QUEUED, h.scheduler.task_queued_handler())
        .await
        .unwrap();

    h.add_resource(ComputeResourceBuilder::new("r-1").build()).await;
    h.add_experiment(
        ExperimentBuilder::new("exp")
            .with_id("exp-1")
            .with_status(ExperimentStatus::Executing)
            .build(),
    )
    .await;
    h.add_task(TaskBuilder::new("exp-1").with_id("t-1").queued().build())
        .await;

    bus.publish(DomainEvent::new(
        "test",
        DomainEventPayload::TaskQueued {
            task_id: "t-1".to_string(),
            experiment_id: "exp-1".to_string(),
        },
    ))
    .await
    .unwrap();

    let repo = h.repo.clone();
    let assigned = TestEnv::wait_for(
        move || {
            let repo = repo.clone();
            async move {
                repo.get_task("t-1")
                    .await
                    .ok()
                    .flatten()
                    .map(|t| t.status == TaskStatus::Running && t.compute_resource_id.is_some())
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(assigned);

    // 重复事件不会再次分配
    assert!(!h.scheduler.process_task("t-1").await.unwrap());
    bus.shutdown().await.unwrap();
}
