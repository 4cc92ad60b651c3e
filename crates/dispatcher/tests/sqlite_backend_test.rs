mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::test_config;
use scheduler_core::DatabaseConfig;
use scheduler_dispatcher::{SchedulerService, StagingOperationManager};
use scheduler_domain::{
    event_types, ComputeResourceRepository, ExperimentRepository, ExperimentStatus, Repository,
    StagingOperation, StagingOperationRepository, StagingOperationStatus, TaskRepository,
    TaskStatus, WorkerRepository, WorkerStatus,
};
use scheduler_errors::SchedulerError;
use scheduler_infrastructure::DatabaseManager;
use scheduler_testing_utils::{
    ComputeResourceBuilder, ExperimentBuilder, MockDataMover, RecordingEventPublisher,
    RecordingWorkerTransport, StagingBehavior, TaskBuilder, WorkerBuilder,
};
use tempfile::TempDir;

async fn open_database(dir: &TempDir) -> DatabaseManager {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("scheduler.db").display()),
        ..Default::default()
    };
    let manager = DatabaseManager::new(&config).await.unwrap();
    manager.migrate().await.unwrap();
    manager
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_assignment_on_sqlite_claims_each_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let database = open_database(&dir).await;
    let repo = database.repository();

    repo.create_compute_resource(&ComputeResourceBuilder::new("r-1").build())
        .await
        .unwrap();
    repo.create_experiment(
        &ExperimentBuilder::new("exp")
            .with_id("exp-1")
            .with_status(ExperimentStatus::Executing)
            .build(),
    )
    .await
    .unwrap();
    for id in ["t-1", "t-2", "t-3"] {
        repo.create_task(
            &TaskBuilder::new("exp-1")
                .with_id(id)
                .with_status(TaskStatus::Running)
                .on_resource("r-1")
                .build(),
        )
        .await
        .unwrap();
    }
    for i in 1..=12 {
        repo.create_worker(&WorkerBuilder::new(&format!("w-{i}"), "r-1", "exp-1").build())
            .await
            .unwrap();
    }

    let events = RecordingEventPublisher::new();
    let scheduler = Arc::new(SchedulerService::new(
        Arc::clone(&repo),
        Arc::new(events.clone()),
        Arc::new(MockDataMover::new(StagingBehavior::Manual)),
        Arc::new(RecordingWorkerTransport::new()),
        &test_config(),
    ));

    let mut handles = Vec::new();
    for i in 1..=12 {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w-{i}");
            // 同时挑中同一个任务时落空的一方重新挑选，直到拿到任务或无任务可分配
            for _ in 0..20 {
                match scheduler.assign_task(&worker_id).await {
                    Err(SchedulerError::AlreadyAssigned { .. }) => continue,
                    other => return other,
                }
            }
            Ok(None)
        }));
    }

    let mut claimed = Vec::new();
    let mut idle = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Some(task)) => claimed.push(task.id),
            Ok(None) => idle += 1,
            Err(e) => panic!("并发分配不应出现错误: {e}"),
        }
    }
    claimed.sort();
    assert_eq!(claimed, vec!["t-1", "t-2", "t-3"]);
    assert_eq!(idle, 9);
    assert_eq!(events.count_of(event_types::TASK_ASSIGNED), 3);

    for task_id in &claimed {
        let task = repo.get_task(task_id).await.unwrap().unwrap();
        let holder = task.worker_id.expect("已认领的任务应绑定Worker");
        let worker = repo.get_worker(&holder).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(worker.current_task_id.as_deref(), Some(task_id.as_str()));
    }

    database.close().await;
}

#[tokio::test]
async fn test_sweep_skips_when_database_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let database = open_database(&dir).await;
    let repo = database.repository();

    let mut stale = StagingOperation::new("t-stale", "w-1", "r-1");
    stale.status = StagingOperationStatus::Running;
    stale.timeout_seconds = 10;
    stale.started_at = Some(Utc::now() - ChronoDuration::seconds(700));
    repo.create_staging_operation(&stale).await.unwrap();

    let mut expired = StagingOperation::new("t-old", "w-1", "r-1");
    expired.status = StagingOperationStatus::Completed;
    expired.updated_at = Utc::now() - ChronoDuration::days(30);
    repo.create_staging_operation(&expired).await.unwrap();

    let events = RecordingEventPublisher::new();
    let manager = StagingOperationManager::new(
        Arc::clone(&repo),
        Arc::new(events.clone()),
        test_config().staging,
    );
    database.close().await;

    let report = manager.sweep_once().await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.timed_out, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(events.count_of(event_types::STAGING_FAILED), 0);

    // 重新打开同一个库确认扫描没有写入任何东西
    let reopened = open_database(&dir).await;
    let repo: Arc<dyn Repository> = reopened.repository();
    let stale = repo.get_staging_operation(&stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, StagingOperationStatus::Running);
    assert!(stale.error_message.is_none());
    assert!(repo.get_staging_operation(&expired.id).await.unwrap().is_some());
    reopened.close().await;
}
