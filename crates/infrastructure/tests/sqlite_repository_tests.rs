use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use scheduler_core::DatabaseConfig;
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, ComputeResourceStatus, ComputeResourceType,
    Experiment, ExperimentRepository, ExperimentStatus, FileMetadata, Repository,
    StagingOperation, StagingOperationFilter, StagingOperationRepository,
    StagingOperationStatus, Task, TaskFilter, TaskGuard, TaskRepository, TaskStatus, Worker,
    WorkerFilter, WorkerMetrics, WorkerMetricsRepository, WorkerRepository, WorkerStatus,
};
use scheduler_infrastructure::DatabaseManager;
use tempfile::TempDir;

struct SqliteTestDb {
    _dir: TempDir,
    manager: DatabaseManager,
    repo: Arc<dyn Repository>,
}

async fn setup() -> Result<SqliteTestDb> {
    let dir = tempfile::tempdir()?;
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("test.db").display()),
        ..Default::default()
    };
    let manager = DatabaseManager::new(&config).await?;
    manager.migrate().await?;
    let repo = manager.repository();
    Ok(SqliteTestDb {
        _dir: dir,
        manager,
        repo,
    })
}

async fn seed_experiment(repo: &Arc<dyn Repository>) -> Result<Experiment> {
    let exp = Experiment::new("sweep", "train --lr {lr}", "alice");
    repo.create_experiment(&exp).await?;
    Ok(exp)
}

#[tokio::test]
async fn test_task_round_trip_preserves_fields() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;

    let mut task = Task::new(&exp.id, "train --lr 0.1");
    task.input_files = vec![FileMetadata::new("/nfs/data.h5", 1024, "abc")];
    task.metadata
        .insert("priority".to_string(), serde_json::json!("high"));
    db.repo.create_task(&task).await?;

    let loaded = db.repo.get_task(&task.id).await?.expect("任务应存在");
    assert_eq!(loaded.command, "train --lr 0.1");
    assert_eq!(loaded.status, TaskStatus::Created);
    assert_eq!(loaded.input_files, task.input_files);
    assert_eq!(loaded.priority().as_deref(), Some("high"));
    assert!(loaded.worker_id.is_none());

    assert!(db.repo.get_task("missing").await?.is_none());

    let mut ghost = Task::new(&exp.id, "noop");
    ghost.id = "ghost".to_string();
    assert!(db.repo.update_task(&ghost).await.unwrap_err().is_not_found());

    db.manager.close().await;
    Ok(())
}

#[tokio::test]
async fn test_task_filters() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;

    let mut queued = Task::new(&exp.id, "a");
    queued.status = TaskStatus::Queued;
    let mut running = Task::new(&exp.id, "b");
    running.status = TaskStatus::Running;
    running.worker_id = Some("w-1".to_string());
    running.compute_resource_id = Some("r-1".to_string());
    let other = Task::new("other-exp", "c");
    for t in [&queued, &running, &other] {
        db.repo.create_task(t).await?;
    }

    let all = db.repo.list_tasks(&TaskFilter::for_experiment(&exp.id)).await?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, queued.id);

    let active = db
        .repo
        .list_tasks(
            &TaskFilter::for_experiment(&exp.id)
                .with_statuses(&[TaskStatus::Queued, TaskStatus::Running]),
        )
        .await?;
    assert_eq!(active.len(), 2);

    let on_resource = db
        .repo
        .list_tasks(&TaskFilter::default().on_resource("r-1"))
        .await?;
    assert_eq!(on_resource.len(), 1);
    assert_eq!(on_resource[0].id, running.id);

    let unassigned = db
        .repo
        .list_tasks(&TaskFilter::for_experiment(&exp.id).unassigned())
        .await?;
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].id, queued.id);

    let by_worker = db
        .repo
        .list_tasks(&TaskFilter::default().for_worker("w-1"))
        .await?;
    assert_eq!(by_worker.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_guarded_update_misses_on_stale_state() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;
    let mut task = Task::new(&exp.id, "a");
    task.status = TaskStatus::Queued;
    db.repo.create_task(&task).await?;

    // 第一次认领命中
    let mut tx = db.repo.begin().await?;
    let mut claimed = tx.get_task(&task.id).await?.expect("任务应存在");
    claimed.status = TaskStatus::Running;
    claimed.worker_id = Some("w-1".to_string());
    let hit = tx
        .update_task_guarded(
            &claimed,
            TaskGuard::status(TaskStatus::Queued).worker_unassigned(),
        )
        .await?;
    assert!(hit);
    tx.commit().await?;

    // 基于旧快照的第二次认领落空
    let mut tx = db.repo.begin().await?;
    let mut stale = task.clone();
    stale.status = TaskStatus::Running;
    stale.worker_id = Some("w-2".to_string());
    let hit = tx
        .update_task_guarded(
            &stale,
            TaskGuard::status(TaskStatus::Queued).worker_unassigned(),
        )
        .await?;
    assert!(!hit);
    tx.rollback().await?;

    let stored = db.repo.get_task(&task.id).await?.expect("任务应存在");
    assert_eq!(stored.worker_id.as_deref(), Some("w-1"));
    Ok(())
}

#[tokio::test]
async fn test_transaction_rollback_discards_all_writes() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;
    let mut task = Task::new(&exp.id, "a");
    task.status = TaskStatus::Queued;
    db.repo.create_task(&task).await?;
    let worker = Worker::new("w-1", "r-1", &exp.id);
    db.repo.create_worker(&worker).await?;

    let mut tx = db.repo.begin().await?;
    let mut t = tx.get_task(&task.id).await?.expect("任务应存在");
    t.status = TaskStatus::Running;
    t.worker_id = Some(worker.id.clone());
    assert!(tx.update_task_guarded(&t, TaskGuard::status(TaskStatus::Queued)).await?);
    let mut w = tx.get_worker(&worker.id).await?.expect("Worker应存在");
    w.status = WorkerStatus::Busy;
    w.current_task_id = Some(task.id.clone());
    assert!(tx.update_worker_guarded(&w, WorkerStatus::Idle).await?);
    // 丢弃事务等同回滚
    drop(tx);

    let t = db.repo.get_task(&task.id).await?.expect("任务应存在");
    let w = db.repo.get_worker(&worker.id).await?.expect("Worker应存在");
    assert_eq!(t.status, TaskStatus::Queued);
    assert!(t.worker_id.is_none());
    assert_eq!(w.status, WorkerStatus::Idle);
    assert!(w.current_task_id.is_none());
    Ok(())
}

#[tokio::test]
async fn test_experiment_guarded_update() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;

    let mut tx = db.repo.begin().await?;
    let mut e = tx.get_experiment(&exp.id).await?.expect("实验应存在");
    e.status = ExperimentStatus::Executing;
    assert!(!tx
        .update_experiment_guarded(&e, ExperimentStatus::Executing)
        .await?);
    assert!(tx
        .update_experiment_guarded(&e, ExperimentStatus::Created)
        .await?);
    tx.commit().await?;

    let stored = db.repo.get_experiment(&exp.id).await?.expect("实验应存在");
    assert_eq!(stored.status, ExperimentStatus::Executing);
    Ok(())
}

#[tokio::test]
async fn test_workers_and_resources() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;

    let mut slurm = ComputeResource::new("slurm-1", "slurm", ComputeResourceType::Slurm, 4);
    slurm.cost_per_hour = 1.5;
    let mut k8s = ComputeResource::new("k8s-1", "kube", ComputeResourceType::Kubernetes, 8);
    k8s.status = ComputeResourceStatus::Inactive;
    db.repo.create_compute_resource(&slurm).await?;
    db.repo.create_compute_resource(&k8s).await?;

    let active = db
        .repo
        .list_compute_resources(Some(ComputeResourceStatus::Active))
        .await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "slurm-1");
    assert_eq!(active[0].cost_per_hour, 1.5);
    assert_eq!(db.repo.list_compute_resources(None).await?.len(), 2);

    let idle = Worker::new("w-1", "slurm-1", &exp.id);
    let mut busy = Worker::new("w-2", "slurm-1", &exp.id);
    busy.status = WorkerStatus::Busy;
    busy.current_task_id = Some("t-1".to_string());
    db.repo.create_worker(&idle).await?;
    db.repo.create_worker(&busy).await?;
    assert!(db.repo.create_worker(&idle).await.is_err());

    let idle_workers = db
        .repo
        .list_workers(
            &WorkerFilter::for_experiment(&exp.id).with_statuses(&[WorkerStatus::Idle]),
        )
        .await?;
    assert_eq!(idle_workers.len(), 1);
    assert_eq!(idle_workers[0].id, "w-1");
    Ok(())
}

#[tokio::test]
async fn test_staging_operation_lifecycle_queries() -> Result<()> {
    let db = setup().await?;

    let mut first = StagingOperation::new("t-1", "w-1", "r-1");
    first.created_at = Utc::now() - Duration::seconds(10);
    db.repo.create_staging_operation(&first).await?;
    let mut second = StagingOperation::new("t-1", "w-1", "r-1");
    second.id = format!("{}-b", second.id);
    db.repo.create_staging_operation(&second).await?;

    let latest = db
        .repo
        .get_staging_operation_by_task("t-1")
        .await?
        .expect("应存在暂存操作");
    assert_eq!(latest.id, second.id);

    // 条件更新：只有PENDING可以启动
    let mut started = first.clone();
    started.status = StagingOperationStatus::Running;
    started.started_at = Some(Utc::now());
    assert!(db
        .repo
        .update_staging_operation(&started, &[StagingOperationStatus::Pending])
        .await?);
    assert!(!db
        .repo
        .update_staging_operation(&started, &[StagingOperationStatus::Pending])
        .await?);

    let incomplete = db
        .repo
        .list_staging_operations(&StagingOperationFilter::with_statuses(&[
            StagingOperationStatus::Pending,
            StagingOperationStatus::Running,
        ]))
        .await?;
    assert_eq!(incomplete.len(), 2);

    // 保留期清理只删除旧的终态操作
    let mut old_done = second.clone();
    old_done.status = StagingOperationStatus::Completed;
    old_done.updated_at = Utc::now() - Duration::days(8);
    assert!(db.repo.update_staging_operation(&old_done, &[]).await?);
    let removed = db
        .repo
        .delete_staging_operations_before(
            &[
                StagingOperationStatus::Completed,
                StagingOperationStatus::Failed,
                StagingOperationStatus::Timeout,
            ],
            Utc::now() - Duration::days(7),
        )
        .await?;
    assert_eq!(removed, 1);
    assert!(db.repo.get_staging_operation(&second.id).await?.is_none());
    assert!(db.repo.get_staging_operation(&first.id).await?.is_some());

    assert!(db.repo.delete_staging_operation(&first.id).await?);
    assert!(!db.repo.delete_staging_operation(&first.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_latest_worker_metrics() -> Result<()> {
    let db = setup().await?;
    assert!(db.repo.get_latest_worker_metrics("w-1").await?.is_none());

    let mut older = WorkerMetrics::sample("w-1", 10.0, 20.0);
    older.recorded_at = Utc::now() - Duration::minutes(5);
    let mut newer = WorkerMetrics::sample("w-1", 55.0, 60.0);
    newer.tasks_completed = 4;
    newer.tasks_failed = 1;
    db.repo.record_worker_metrics(&older).await?;
    db.repo.record_worker_metrics(&newer).await?;

    let latest = db
        .repo
        .get_latest_worker_metrics("w-1")
        .await?
        .expect("应有指标");
    assert_eq!(latest.cpu_usage_percent, 55.0);
    assert!((latest.success_rate() - 0.8).abs() < 1e-9);
    Ok(())
}

/// 在一个事务内按条件认领任务并占用Worker，落空时回滚
async fn claim_in_transaction(
    repo: Arc<dyn Repository>,
    task_id: String,
    worker_id: String,
) -> Result<bool> {
    let mut tx = repo.begin().await?;
    let mut task = tx.get_task(&task_id).await?.expect("任务应存在");
    if task.worker_id.is_some() {
        tx.rollback().await?;
        return Ok(false);
    }
    task.worker_id = Some(worker_id.clone());
    let hit = tx
        .update_task_guarded(
            &task,
            TaskGuard::status(TaskStatus::Running).worker_unassigned(),
        )
        .await?;
    if !hit {
        tx.rollback().await?;
        return Ok(false);
    }
    let mut worker = tx.get_worker(&worker_id).await?.expect("Worker应存在");
    worker.status = WorkerStatus::Busy;
    worker.current_task_id = Some(task_id);
    assert!(tx.update_worker_guarded(&worker, WorkerStatus::Idle).await?);
    tx.commit().await?;
    Ok(true)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_write_transactions_wait_instead_of_failing() -> Result<()> {
    let db = setup().await?;
    let exp = seed_experiment(&db.repo).await?;
    let mut task_ids = Vec::new();
    for command in ["a", "b", "c"] {
        let mut task = Task::new(&exp.id, command);
        task.status = TaskStatus::Running;
        db.repo.create_task(&task).await?;
        task_ids.push(task.id);
    }
    for i in 0..12 {
        db.repo
            .create_worker(&Worker::new(format!("w-{i}"), "r-1", &exp.id))
            .await?;
    }

    // 每个任务有四个Worker同时争抢
    let mut handles = Vec::new();
    for i in 0..12 {
        let repo = Arc::clone(&db.repo);
        let task_id = task_ids[i % 3].clone();
        handles.push(tokio::spawn(claim_in_transaction(
            repo,
            task_id,
            format!("w-{i}"),
        )));
    }

    let mut hits = 0;
    for handle in handles {
        // 任何数据库错误（例如database is locked）都会在这里失败
        if handle.await?? {
            hits += 1;
        }
    }
    assert_eq!(hits, 3);

    for task_id in &task_ids {
        let task = db.repo.get_task(task_id).await?.expect("任务应存在");
        let holder = task.worker_id.expect("任务应被认领");
        let worker = db.repo.get_worker(&holder).await?.expect("Worker应存在");
        assert_eq!(worker.current_task_id.as_deref(), Some(task_id.as_str()));
    }
    let busy = db
        .repo
        .list_workers(&WorkerFilter::default())
        .await?
        .into_iter()
        .filter(|w| w.status == WorkerStatus::Busy)
        .count();
    assert_eq!(busy, 3);

    db.manager.close().await;
    Ok(())
}
