//! 可按需注入故障的仓储包装

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, ComputeResourceStatus, Experiment,
    ExperimentRepository, Repository, RepositoryTransaction, StagingOperation,
    StagingOperationFilter, StagingOperationRepository, StagingOperationStatus, Task, TaskFilter,
    TaskRepository, Worker, WorkerFilter, WorkerMetrics, WorkerMetricsRepository,
    WorkerRepository,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 其余调用原样转发给内部仓储
#[derive(Clone)]
pub struct FlakyRepository {
    inner: Arc<dyn Repository>,
    failing_begins: Arc<AtomicUsize>,
    unreachable: Arc<AtomicBool>,
}

impl FlakyRepository {
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            failing_begins: Arc::new(AtomicUsize::new(0)),
            unreachable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 接下来 `count` 次开启事务失败
    pub fn fail_next_transactions(&self, count: usize) {
        self.failing_begins.store(count, Ordering::SeqCst);
    }

    /// 之后的连通性检查全部失败
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskRepository for FlakyRepository {
    async fn create_task(&self, task: &Task) -> SchedulerResult<()> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn update_task(&self, task: &Task) -> SchedulerResult<()> {
        self.inner.update_task(task).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.inner.list_tasks(filter).await
    }
}

#[async_trait]
impl WorkerRepository for FlakyRepository {
    async fn create_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        self.inner.create_worker(worker).await
    }

    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<Worker>> {
        self.inner.get_worker(id).await
    }

    async fn update_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        self.inner.update_worker(worker).await
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> SchedulerResult<Vec<Worker>> {
        self.inner.list_workers(filter).await
    }
}

#[async_trait]
impl ExperimentRepository for FlakyRepository {
    async fn create_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        self.inner.create_experiment(experiment).await
    }

    async fn get_experiment(&self, id: &str) -> SchedulerResult<Option<Experiment>> {
        self.inner.get_experiment(id).await
    }

    async fn update_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        self.inner.update_experiment(experiment).await
    }
}

#[async_trait]
impl ComputeResourceRepository for FlakyRepository {
    async fn create_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()> {
        self.inner.create_compute_resource(resource).await
    }

    async fn get_compute_resource(&self, id: &str) -> SchedulerResult<Option<ComputeResource>> {
        self.inner.get_compute_resource(id).await
    }

    async fn update_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()> {
        self.inner.update_compute_resource(resource).await
    }

    async fn list_compute_resources(
        &self,
        status: Option<ComputeResourceStatus>,
    ) -> SchedulerResult<Vec<ComputeResource>> {
        self.inner.list_compute_resources(status).await
    }
}

#[async_trait]
impl StagingOperationRepository for FlakyRepository {
    async fn create_staging_operation(&self, op: &StagingOperation) -> SchedulerResult<()> {
        self.inner.create_staging_operation(op).await
    }

    async fn get_staging_operation(&self, id: &str) -> SchedulerResult<Option<StagingOperation>> {
        self.inner.get_staging_operation(id).await
    }

    async fn get_staging_operation_by_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<StagingOperation>> {
        self.inner.get_staging_operation_by_task(task_id).await
    }

    async fn update_staging_operation(
        &self,
        op: &StagingOperation,
        expected: &[StagingOperationStatus],
    ) -> SchedulerResult<bool> {
        self.inner.update_staging_operation(op, expected).await
    }

    async fn list_staging_operations(
        &self,
        filter: &StagingOperationFilter,
    ) -> SchedulerResult<Vec<StagingOperation>> {
        self.inner.list_staging_operations(filter).await
    }

    async fn delete_staging_operation(&self, id: &str) -> SchedulerResult<bool> {
        self.inner.delete_staging_operation(id).await
    }

    async fn delete_staging_operations_before(
        &self,
        statuses: &[StagingOperationStatus],
        before: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        self.inner
            .delete_staging_operations_before(statuses, before)
            .await
    }
}

#[async_trait]
impl WorkerMetricsRepository for FlakyRepository {
    async fn record_worker_metrics(&self, metrics: &WorkerMetrics) -> SchedulerResult<()> {
        self.inner.record_worker_metrics(metrics).await
    }

    async fn get_latest_worker_metrics(
        &self,
        worker_id: &str,
    ) -> SchedulerResult<Option<WorkerMetrics>> {
        self.inner.get_latest_worker_metrics(worker_id).await
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn begin(&self) -> SchedulerResult<Box<dyn RepositoryTransaction>> {
        let armed = self
            .failing_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(SchedulerError::database_error("注入的事务失败"));
        }
        self.inner.begin().await
    }

    async fn ping(&self) -> SchedulerResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SchedulerError::database_error("注入的连接失败"));
        }
        self.inner.ping().await
    }
}
