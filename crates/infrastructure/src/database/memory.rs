//! 进程内仓储实现
//!
//! 整个存储由一把异步互斥锁保护。事务持有锁并在快照上修改，提交时整体写回，
//! 因此事务之间天然串行。事务打开期间不要在同一任务里调用非事务方法，否则会自锁。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, ComputeResourceStatus, Experiment,
    ExperimentRepository, ExperimentStatus, Repository, RepositoryTransaction, StagingOperation,
    StagingOperationFilter, StagingOperationRepository, StagingOperationStatus, Task, TaskFilter,
    TaskGuard, TaskRepository, Worker, WorkerFilter, WorkerMetrics, WorkerMetricsRepository,
    WorkerRepository, WorkerStatus,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 带插入序号的记录，用于稳定排序
#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    value: T,
}

#[derive(Debug, Clone, Default)]
struct Store {
    next_seq: u64,
    tasks: HashMap<String, Stored<Task>>,
    workers: HashMap<String, Stored<Worker>>,
    experiments: HashMap<String, Stored<Experiment>>,
    compute_resources: HashMap<String, Stored<ComputeResource>>,
    staging_operations: HashMap<String, Stored<StagingOperation>>,
    worker_metrics: Vec<WorkerMetrics>,
}

impl Store {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn insert_new<T>(
    map: &mut HashMap<String, Stored<T>>,
    seq: u64,
    id: &str,
    value: T,
    entity: &str,
) -> SchedulerResult<()> {
    if map.contains_key(id) {
        return Err(SchedulerError::database_error(format!(
            "{entity} {id} 已存在"
        )));
    }
    map.insert(id.to_string(), Stored { seq, value });
    Ok(())
}

fn sorted_by<T: Clone, K: Ord>(
    map: &HashMap<String, Stored<T>>,
    keep: impl Fn(&T) -> bool,
    key: impl Fn(&T) -> K,
) -> Vec<T> {
    let mut items: Vec<&Stored<T>> = map.values().filter(|s| keep(&s.value)).collect();
    items.sort_by(|a, b| key(&a.value).cmp(&key(&b.value)).then(a.seq.cmp(&b.seq)));
    items.into_iter().map(|s| s.value.clone()).collect()
}

/// 内存仓储，适用于测试与 `memory://` 开发部署
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    store: Arc<Mutex<Store>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryRepository {
    async fn create_task(&self, task: &Task) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        let seq = store.next_seq();
        insert_new(&mut store.tasks, seq, &task.id, task.clone(), "任务")
    }

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let store = self.store.lock().await;
        Ok(store.tasks.get(id).map(|s| s.value.clone()))
    }

    async fn update_task(&self, task: &Task) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        match store.tasks.get_mut(&task.id) {
            Some(stored) => {
                stored.value = task.clone();
                Ok(())
            }
            None => Err(SchedulerError::task_not_found(&task.id)),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let store = self.store.lock().await;
        let mut tasks = sorted_by(&store.tasks, |t| filter.matches(t), |t| t.created_at);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit.max(0) as usize);
        }
        Ok(tasks)
    }
}

#[async_trait]
impl WorkerRepository for InMemoryRepository {
    async fn create_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        let seq = store.next_seq();
        insert_new(&mut store.workers, seq, &worker.id, worker.clone(), "Worker")
    }

    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<Worker>> {
        let store = self.store.lock().await;
        Ok(store.workers.get(id).map(|s| s.value.clone()))
    }

    async fn update_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        match store.workers.get_mut(&worker.id) {
            Some(stored) => {
                stored.value = worker.clone();
                Ok(())
            }
            None => Err(SchedulerError::worker_not_found(&worker.id)),
        }
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> SchedulerResult<Vec<Worker>> {
        let store = self.store.lock().await;
        Ok(sorted_by(
            &store.workers,
            |w| filter.matches(w),
            |w| w.registered_at,
        ))
    }
}

#[async_trait]
impl ExperimentRepository for InMemoryRepository {
    async fn create_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        let seq = store.next_seq();
        insert_new(
            &mut store.experiments,
            seq,
            &experiment.id,
            experiment.clone(),
            "实验",
        )
    }

    async fn get_experiment(&self, id: &str) -> SchedulerResult<Option<Experiment>> {
        let store = self.store.lock().await;
        Ok(store.experiments.get(id).map(|s| s.value.clone()))
    }

    async fn update_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        match store.experiments.get_mut(&experiment.id) {
            Some(stored) => {
                stored.value = experiment.clone();
                Ok(())
            }
            None => Err(SchedulerError::experiment_not_found(&experiment.id)),
        }
    }
}

#[async_trait]
impl ComputeResourceRepository for InMemoryRepository {
    async fn create_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        let seq = store.next_seq();
        insert_new(
            &mut store.compute_resources,
            seq,
            &resource.id,
            resource.clone(),
            "计算资源",
        )
    }

    async fn get_compute_resource(&self, id: &str) -> SchedulerResult<Option<ComputeResource>> {
        let store = self.store.lock().await;
        Ok(store.compute_resources.get(id).map(|s| s.value.clone()))
    }

    async fn update_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        match store.compute_resources.get_mut(&resource.id) {
            Some(stored) => {
                stored.value = resource.clone();
                Ok(())
            }
            None => Err(SchedulerError::compute_resource_not_found(&resource.id)),
        }
    }

    async fn list_compute_resources(
        &self,
        status: Option<ComputeResourceStatus>,
    ) -> SchedulerResult<Vec<ComputeResource>> {
        let store = self.store.lock().await;
        Ok(sorted_by(
            &store.compute_resources,
            |r| status.map_or(true, |s| r.status == s),
            |r| r.created_at,
        ))
    }
}

#[async_trait]
impl StagingOperationRepository for InMemoryRepository {
    async fn create_staging_operation(&self, op: &StagingOperation) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        let seq = store.next_seq();
        insert_new(&mut store.staging_operations, seq, &op.id, op.clone(), "暂存操作")
    }

    async fn get_staging_operation(&self, id: &str) -> SchedulerResult<Option<StagingOperation>> {
        let store = self.store.lock().await;
        Ok(store.staging_operations.get(id).map(|s| s.value.clone()))
    }

    async fn get_staging_operation_by_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<StagingOperation>> {
        let store = self.store.lock().await;
        Ok(store
            .staging_operations
            .values()
            .filter(|s| s.value.task_id == task_id)
            .max_by(|a, b| {
                a.value
                    .created_at
                    .cmp(&b.value.created_at)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|s| s.value.clone()))
    }

    async fn update_staging_operation(
        &self,
        op: &StagingOperation,
        expected: &[StagingOperationStatus],
    ) -> SchedulerResult<bool> {
        let mut store = self.store.lock().await;
        match store.staging_operations.get_mut(&op.id) {
            Some(stored) if expected.is_empty() || expected.contains(&stored.value.status) => {
                stored.value = op.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_staging_operations(
        &self,
        filter: &StagingOperationFilter,
    ) -> SchedulerResult<Vec<StagingOperation>> {
        let store = self.store.lock().await;
        Ok(sorted_by(
            &store.staging_operations,
            |op| filter.matches(op),
            |op| op.created_at,
        ))
    }

    async fn delete_staging_operation(&self, id: &str) -> SchedulerResult<bool> {
        let mut store = self.store.lock().await;
        Ok(store.staging_operations.remove(id).is_some())
    }

    async fn delete_staging_operations_before(
        &self,
        statuses: &[StagingOperationStatus],
        before: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut store = self.store.lock().await;
        let len_before = store.staging_operations.len();
        store
            .staging_operations
            .retain(|_, s| !(statuses.contains(&s.value.status) && s.value.updated_at < before));
        Ok((len_before - store.staging_operations.len()) as u64)
    }
}

#[async_trait]
impl WorkerMetricsRepository for InMemoryRepository {
    async fn record_worker_metrics(&self, metrics: &WorkerMetrics) -> SchedulerResult<()> {
        let mut store = self.store.lock().await;
        store.worker_metrics.push(metrics.clone());
        Ok(())
    }

    async fn get_latest_worker_metrics(
        &self,
        worker_id: &str,
    ) -> SchedulerResult<Option<WorkerMetrics>> {
        let store = self.store.lock().await;
        // 同一时间戳取后写入的一条
        Ok(store
            .worker_metrics
            .iter()
            .enumerate()
            .filter(|(_, m)| m.worker_id == worker_id)
            .max_by(|(ia, a), (ib, b)| a.recorded_at.cmp(&b.recorded_at).then(ia.cmp(ib)))
            .map(|(_, m)| m.clone()))
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn begin(&self) -> SchedulerResult<Box<dyn RepositoryTransaction>> {
        let guard = Arc::clone(&self.store).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, working }))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// 持有存储锁的事务；提交时把工作副本写回
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Store>,
    working: Store,
}

#[async_trait]
impl RepositoryTransaction for InMemoryTransaction {
    async fn get_task(&mut self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.working.tasks.get(id).map(|s| s.value.clone()))
    }

    async fn get_worker(&mut self, id: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.working.workers.get(id).map(|s| s.value.clone()))
    }

    async fn get_experiment(&mut self, id: &str) -> SchedulerResult<Option<Experiment>> {
        Ok(self.working.experiments.get(id).map(|s| s.value.clone()))
    }

    async fn update_task_guarded(
        &mut self,
        task: &Task,
        guard: TaskGuard,
    ) -> SchedulerResult<bool> {
        match self.working.tasks.get_mut(&task.id) {
            Some(stored) if guard.matches(&stored.value) => {
                stored.value = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_worker_guarded(
        &mut self,
        worker: &Worker,
        expected: WorkerStatus,
    ) -> SchedulerResult<bool> {
        match self.working.workers.get_mut(&worker.id) {
            Some(stored) if stored.value.status == expected => {
                stored.value = worker.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_experiment_guarded(
        &mut self,
        experiment: &Experiment,
        expected: ExperimentStatus,
    ) -> SchedulerResult<bool> {
        match self.working.experiments.get_mut(&experiment.id) {
            Some(stored) if stored.value.status == expected => {
                stored.value = experiment.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> SchedulerResult<()> {
        let InMemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SchedulerResult<()> {
        Ok(())
    }
}
