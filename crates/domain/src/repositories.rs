//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则。多步写入通过 [`RepositoryTransaction`]
//! 在同一个事务内完成，带条件的更新返回是否命中，用于乐观并发控制。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_errors::SchedulerResult;

use crate::entities::{
    ComputeResource, ComputeResourceStatus, Experiment, ExperimentStatus, StagingOperation,
    StagingOperationStatus, Task, TaskStatus, Worker, WorkerMetrics, WorkerStatus,
};

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub experiment_id: Option<String>,
    /// 为空表示不限状态
    pub statuses: Vec<TaskStatus>,
    pub compute_resource_id: Option<String>,
    pub worker_id: Option<String>,
    /// 只返回尚未分配Worker的任务
    pub worker_unassigned: bool,
    pub limit: Option<i64>,
}

impl TaskFilter {
    pub fn for_experiment(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: Some(experiment_id.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: &[TaskStatus]) -> Self {
        self.statuses.extend_from_slice(statuses);
        self
    }

    pub fn on_resource(mut self, compute_resource_id: impl Into<String>) -> Self {
        self.compute_resource_id = Some(compute_resource_id.into());
        self
    }

    pub fn for_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.worker_unassigned = true;
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(experiment_id) = &self.experiment_id {
            if &task.experiment_id != experiment_id {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(resource_id) = &self.compute_resource_id {
            if task.compute_resource_id.as_ref() != Some(resource_id) {
                return false;
            }
        }
        if let Some(worker_id) = &self.worker_id {
            if task.worker_id.as_ref() != Some(worker_id) {
                return false;
            }
        }
        if self.worker_unassigned && task.worker_id.is_some() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub experiment_id: Option<String>,
    pub compute_resource_id: Option<String>,
    pub statuses: Vec<WorkerStatus>,
}

impl WorkerFilter {
    pub fn for_experiment(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: Some(experiment_id.into()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[WorkerStatus]) -> Self {
        self.statuses.extend_from_slice(statuses);
        self
    }

    pub fn matches(&self, worker: &Worker) -> bool {
        self.experiment_id
            .as_ref()
            .map_or(true, |id| &worker.experiment_id == id)
            && self
                .compute_resource_id
                .as_ref()
                .map_or(true, |id| &worker.compute_resource_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&worker.status))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StagingOperationFilter {
    pub task_id: Option<String>,
    pub statuses: Vec<StagingOperationStatus>,
}

impl StagingOperationFilter {
    pub fn with_statuses(statuses: &[StagingOperationStatus]) -> Self {
        Self {
            task_id: None,
            statuses: statuses.to_vec(),
        }
    }

    pub fn matches(&self, op: &StagingOperation) -> bool {
        self.task_id.as_ref().map_or(true, |id| &op.task_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&op.status))
    }
}

/// 任务条件更新的前置条件（比较并交换）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGuard {
    pub status: TaskStatus,
    pub worker_unassigned: bool,
    pub resource_unassigned: bool,
}

impl TaskGuard {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            worker_unassigned: false,
            resource_unassigned: false,
        }
    }

    pub fn worker_unassigned(mut self) -> Self {
        self.worker_unassigned = true;
        self
    }

    pub fn resource_unassigned(mut self) -> Self {
        self.resource_unassigned = true;
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        task.status == self.status
            && (!self.worker_unassigned || task.worker_id.is_none())
            && (!self.resource_unassigned || task.compute_resource_id.is_none())
    }
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: &Task) -> SchedulerResult<()>;
    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>>;
    async fn update_task(&self, task: &Task) -> SchedulerResult<()>;
    async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;
}

/// Worker仓储抽象
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn create_worker(&self, worker: &Worker) -> SchedulerResult<()>;
    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<Worker>>;
    async fn update_worker(&self, worker: &Worker) -> SchedulerResult<()>;
    async fn list_workers(&self, filter: &WorkerFilter) -> SchedulerResult<Vec<Worker>>;
}

/// 实验仓储抽象
#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    async fn create_experiment(&self, experiment: &Experiment) -> SchedulerResult<()>;
    async fn get_experiment(&self, id: &str) -> SchedulerResult<Option<Experiment>>;
    async fn update_experiment(&self, experiment: &Experiment) -> SchedulerResult<()>;
}

/// 计算资源仓储抽象
#[async_trait]
pub trait ComputeResourceRepository: Send + Sync {
    async fn create_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()>;
    async fn get_compute_resource(&self, id: &str) -> SchedulerResult<Option<ComputeResource>>;
    async fn update_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()>;
    /// 按创建时间升序返回；`status` 为 None 时返回全部
    async fn list_compute_resources(
        &self,
        status: Option<ComputeResourceStatus>,
    ) -> SchedulerResult<Vec<ComputeResource>>;
}

/// 暂存操作仓储抽象
#[async_trait]
pub trait StagingOperationRepository: Send + Sync {
    async fn create_staging_operation(&self, op: &StagingOperation) -> SchedulerResult<()>;
    async fn get_staging_operation(&self, id: &str) -> SchedulerResult<Option<StagingOperation>>;
    /// 同一任务的最新一次暂存操作
    async fn get_staging_operation_by_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<StagingOperation>>;
    /// 仅当当前状态属于 `expected` 时更新；`expected` 为空表示无条件更新
    async fn update_staging_operation(
        &self,
        op: &StagingOperation,
        expected: &[StagingOperationStatus],
    ) -> SchedulerResult<bool>;
    async fn list_staging_operations(
        &self,
        filter: &StagingOperationFilter,
    ) -> SchedulerResult<Vec<StagingOperation>>;
    async fn delete_staging_operation(&self, id: &str) -> SchedulerResult<bool>;
    /// 删除指定状态且更新时间早于 `before` 的操作，返回删除数量
    async fn delete_staging_operations_before(
        &self,
        statuses: &[StagingOperationStatus],
        before: DateTime<Utc>,
    ) -> SchedulerResult<u64>;
}

/// Worker指标仓储抽象
#[async_trait]
pub trait WorkerMetricsRepository: Send + Sync {
    async fn record_worker_metrics(&self, metrics: &WorkerMetrics) -> SchedulerResult<()>;
    async fn get_latest_worker_metrics(
        &self,
        worker_id: &str,
    ) -> SchedulerResult<Option<WorkerMetrics>>;
}

/// 一次原子的多步写入；未提交即丢弃视为回滚
#[async_trait]
pub trait RepositoryTransaction: Send {
    async fn get_task(&mut self, id: &str) -> SchedulerResult<Option<Task>>;
    async fn get_worker(&mut self, id: &str) -> SchedulerResult<Option<Worker>>;
    async fn get_experiment(&mut self, id: &str) -> SchedulerResult<Option<Experiment>>;
    /// 仅当持久化的任务满足 `guard` 时写入，返回是否命中
    async fn update_task_guarded(&mut self, task: &Task, guard: TaskGuard)
        -> SchedulerResult<bool>;
    async fn update_worker_guarded(
        &mut self,
        worker: &Worker,
        expected: WorkerStatus,
    ) -> SchedulerResult<bool>;
    async fn update_experiment_guarded(
        &mut self,
        experiment: &Experiment,
        expected: ExperimentStatus,
    ) -> SchedulerResult<bool>;
    async fn commit(self: Box<Self>) -> SchedulerResult<()>;
    async fn rollback(self: Box<Self>) -> SchedulerResult<()>;
}

/// 调度核心依赖的完整仓储端口
#[async_trait]
pub trait Repository:
    TaskRepository
    + WorkerRepository
    + ExperimentRepository
    + ComputeResourceRepository
    + StagingOperationRepository
    + WorkerMetricsRepository
{
    async fn begin(&self) -> SchedulerResult<Box<dyn RepositoryTransaction>>;
    /// 检查存储是否可达
    async fn ping(&self) -> SchedulerResult<()>;
}
