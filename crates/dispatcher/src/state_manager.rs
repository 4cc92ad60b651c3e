//! 状态管理器
//!
//! 任务、Worker、实验状态变更的唯一入口。每次转换先校验状态机，再在同一事务中
//! 以比较并交换的方式写入；提交成功后才依次调用观察者并发布事件。观察者和事件发布
//! 的失败只记录日志，不会回滚已提交的转换。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scheduler_domain::{
    is_valid_experiment_transition, is_valid_task_transition, is_valid_worker_transition,
    DomainEvent, DomainEventPayload, EventPublisher, Experiment, ExperimentStatus, Metadata,
    Repository, RepositoryTransaction, Task, TaskGuard, TaskRepository, TaskStatus, Worker,
    WorkerStatus,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 本服务发布事件时使用的来源标识
pub const EVENT_SOURCE: &str = "scheduler";

/// 一次已提交的状态变更
#[derive(Debug, Clone)]
pub struct StateChange<S> {
    pub entity_id: String,
    pub from: S,
    pub to: S,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

pub type TaskStateChange = StateChange<TaskStatus>;
pub type WorkerStateChange = StateChange<WorkerStatus>;
pub type ExperimentStateChange = StateChange<ExperimentStatus>;

pub type TaskStateHook = Arc<dyn Fn(&TaskStateChange) -> SchedulerResult<()> + Send + Sync>;
pub type WorkerStateHook = Arc<dyn Fn(&WorkerStateChange) -> SchedulerResult<()> + Send + Sync>;
pub type ExperimentStateHook =
    Arc<dyn Fn(&ExperimentStateChange) -> SchedulerResult<()> + Send + Sync>;

type TaskMutation = Box<dyn FnOnce(&mut Task) + Send>;

/// 任务转换的附加条件与字段修改
#[derive(Default)]
pub struct TaskTransition {
    metadata: Metadata,
    require_worker_unassigned: bool,
    require_resource_unassigned: bool,
    mutation: Option<TaskMutation>,
}

impl TaskTransition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_entry(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// 写入时要求任务仍未分配Worker
    pub fn require_worker_unassigned(mut self) -> Self {
        self.require_worker_unassigned = true;
        self
    }

    /// 写入时要求任务仍未分配计算资源
    pub fn require_resource_unassigned(mut self) -> Self {
        self.require_resource_unassigned = true;
        self
    }

    /// 在同一事务内对任务做的额外修改
    pub fn mutate<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        self.mutation = Some(Box::new(f));
        self
    }

    fn guard(&self, from: TaskStatus) -> TaskGuard {
        let mut guard = TaskGuard::status(from);
        if self.require_worker_unassigned {
            guard = guard.worker_unassigned();
        }
        if self.require_resource_unassigned {
            guard = guard.resource_unassigned();
        }
        guard
    }
}

pub struct StateManager {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    task_hooks: RwLock<Vec<TaskStateHook>>,
    worker_hooks: RwLock<Vec<WorkerStateHook>>,
    experiment_hooks: RwLock<Vec<ExperimentStateHook>>,
}

impl StateManager {
    pub fn new(repo: Arc<dyn Repository>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            repo,
            events,
            task_hooks: RwLock::new(Vec::new()),
            worker_hooks: RwLock::new(Vec::new()),
            experiment_hooks: RwLock::new(Vec::new()),
        }
    }

    pub async fn on_task_state_change(&self, hook: TaskStateHook) {
        self.task_hooks.write().await.push(hook);
    }

    pub async fn on_worker_state_change(&self, hook: WorkerStateHook) {
        self.worker_hooks.write().await.push(hook);
    }

    pub async fn on_experiment_state_change(&self, hook: ExperimentStateHook) {
        self.experiment_hooks.write().await.push(hook);
    }

    pub async fn transition_task_state(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        metadata: Metadata,
    ) -> SchedulerResult<Task> {
        self.transition_task_state_with(
            task_id,
            from,
            to,
            TaskTransition::new().with_metadata(metadata),
        )
        .await
    }

    pub async fn transition_task_state_with(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        transition: TaskTransition,
    ) -> SchedulerResult<Task> {
        if !is_valid_task_transition(from, to) {
            return Err(SchedulerError::invalid_transition("任务", from, to));
        }

        let mut tx = self.repo.begin().await?;
        let result = apply_task_transition(tx.as_mut(), task_id, from, to, transition).await;
        let (task, metadata) = match result {
            Ok(applied) => applied,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        debug!("任务 {} 状态转换: {} -> {}", task_id, from, to);
        self.notify_task(StateChange {
            entity_id: task_id.to_string(),
            from,
            to,
            timestamp: task.updated_at,
            metadata,
        })
        .await;
        Ok(task)
    }

    pub async fn transition_worker_state(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        metadata: Metadata,
    ) -> SchedulerResult<Worker> {
        if !is_valid_worker_transition(from, to) {
            return Err(SchedulerError::invalid_transition("Worker", from, to));
        }

        let mut tx = self.repo.begin().await?;
        let worker = match tx.get_worker(worker_id).await {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                rollback_quietly(tx).await;
                return Err(SchedulerError::worker_not_found(worker_id));
            }
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };

        let updated = match prepare_worker(worker, from, to, &metadata) {
            Ok(updated) => updated,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        match tx.update_worker_guarded(&updated, from).await {
            Ok(true) => {}
            Ok(false) => {
                rollback_quietly(tx).await;
                return Err(SchedulerError::state_mismatch(
                    "Worker",
                    worker_id,
                    from,
                    "已被并发修改",
                ));
            }
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        }
        tx.commit().await?;

        debug!("Worker {} 状态转换: {} -> {}", worker_id, from, to);
        self.notify_worker(StateChange {
            entity_id: worker_id.to_string(),
            from,
            to,
            timestamp: updated.updated_at,
            metadata,
        })
        .await;
        Ok(updated)
    }

    pub async fn transition_experiment_state(
        &self,
        experiment_id: &str,
        from: ExperimentStatus,
        to: ExperimentStatus,
        metadata: Metadata,
    ) -> SchedulerResult<Experiment> {
        if !is_valid_experiment_transition(from, to) {
            return Err(SchedulerError::invalid_transition("实验", from, to));
        }

        let mut tx = self.repo.begin().await?;
        let mut experiment = match tx.get_experiment(experiment_id).await {
            Ok(Some(experiment)) => experiment,
            Ok(None) => {
                rollback_quietly(tx).await;
                return Err(SchedulerError::experiment_not_found(experiment_id));
            }
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        if experiment.status != from {
            rollback_quietly(tx).await;
            return Err(SchedulerError::state_mismatch(
                "实验",
                experiment_id,
                from,
                experiment.status,
            ));
        }

        let now = Utc::now();
        experiment.status = to;
        merge_metadata(&mut experiment.metadata, &metadata);
        if to == ExperimentStatus::Executing && experiment.started_at.is_none() {
            experiment.started_at = Some(now);
        }
        if to.is_terminal() && experiment.completed_at.is_none() {
            experiment.completed_at = Some(now);
        }
        experiment.updated_at = now;

        match tx.update_experiment_guarded(&experiment, from).await {
            Ok(true) => {}
            Ok(false) => {
                rollback_quietly(tx).await;
                return Err(SchedulerError::state_mismatch(
                    "实验",
                    experiment_id,
                    from,
                    "已被并发修改",
                ));
            }
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        }
        tx.commit().await?;

        info!("实验 {} 状态转换: {} -> {}", experiment_id, from, to);
        self.notify_experiment(StateChange {
            entity_id: experiment_id.to_string(),
            from,
            to,
            timestamp: now,
            metadata,
        })
        .await;
        Ok(experiment)
    }

    /// 在一个事务内认领任务并将Worker置为BUSY
    ///
    /// 任务必须处于RUNNING（已分配计算资源、等待Worker）且未被认领；认领落空时整个分配失败。
    pub async fn claim_task_for_worker(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> SchedulerResult<(Task, Worker)> {
        let mut tx = self.repo.begin().await?;
        let claimed = claim_in_transaction(tx.as_mut(), task_id, worker_id).await;
        let (task, worker) = match claimed {
            Ok(pair) => pair,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        info!("Worker {} 认领任务 {}", worker_id, task_id);
        let mut metadata = Metadata::new();
        metadata.insert("task_id".to_string(), serde_json::json!(task_id));
        self.notify_worker(StateChange {
            entity_id: worker_id.to_string(),
            from: WorkerStatus::Idle,
            to: WorkerStatus::Busy,
            timestamp: worker.updated_at,
            metadata,
        })
        .await;
        Ok((task, worker))
    }

    /// 任务重新入队
    ///
    /// 清空Worker与计算资源；`increment_retry` 时重试次数加一。已在队列中但仍绑定Worker的
    /// 任务只清空分配，不产生状态变更。
    pub async fn requeue_task(
        &self,
        task_id: &str,
        increment_retry: bool,
        error: Option<String>,
    ) -> SchedulerResult<Task> {
        let current = self
            .repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))?;

        if current.status == TaskStatus::Queued {
            return self
                .clear_queued_assignment(current, increment_retry, error)
                .await;
        }

        self.transition_task_state_with(
            task_id,
            current.status,
            TaskStatus::Queued,
            TaskTransition::new()
                .with_entry("requeued", serde_json::json!(true))
                .mutate(move |task| {
                    if increment_retry {
                        task.retry_count += 1;
                    }
                    if error.is_some() {
                        task.error = error;
                    }
                    task.worker_id = None;
                    task.compute_resource_id = None;
                }),
        )
        .await
    }

    /// 撤销Worker对任务的认领：任务回到RUNNING（仅分配计算资源），Worker回到IDLE
    pub async fn release_claim(&self, task_id: &str, worker_id: &str) -> SchedulerResult<Task> {
        let mut tx = self.repo.begin().await?;
        let released = release_in_transaction(tx.as_mut(), task_id, worker_id).await;
        let (task, from, worker) = match released {
            Ok(released) => released,
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        warn!("已撤销Worker {} 对任务 {} 的认领", worker_id, task_id);
        let mut metadata = Metadata::new();
        metadata.insert("reason".to_string(), serde_json::json!("claim_released"));
        if from != TaskStatus::Running {
            self.notify_task(StateChange {
                entity_id: task_id.to_string(),
                from,
                to: TaskStatus::Running,
                timestamp: task.updated_at,
                metadata: metadata.clone(),
            })
            .await;
        }
        if let Some(worker) = worker {
            self.notify_worker(StateChange {
                entity_id: worker_id.to_string(),
                from: WorkerStatus::Busy,
                to: WorkerStatus::Idle,
                timestamp: worker.updated_at,
                metadata,
            })
            .await;
        }
        Ok(task)
    }

    async fn clear_queued_assignment(
        &self,
        mut task: Task,
        increment_retry: bool,
        error: Option<String>,
    ) -> SchedulerResult<Task> {
        if task.worker_id.is_none() && task.compute_resource_id.is_none() && !increment_retry {
            return Ok(task);
        }
        task.worker_id = None;
        task.compute_resource_id = None;
        if increment_retry {
            task.retry_count += 1;
        }
        if error.is_some() {
            task.error = error;
        }
        task.updated_at = Utc::now();

        let mut tx = self.repo.begin().await?;
        match tx
            .update_task_guarded(&task, TaskGuard::status(TaskStatus::Queued))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                rollback_quietly(tx).await;
                return Err(SchedulerError::state_mismatch(
                    "任务",
                    &task.id,
                    TaskStatus::Queued,
                    "已被并发修改",
                ));
            }
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e);
            }
        }
        tx.commit().await?;
        debug!("清空已入队任务 {} 的分配", task.id);
        Ok(task)
    }

    async fn notify_task(&self, change: TaskStateChange) {
        let hooks = self.task_hooks.read().await.clone();
        for hook in hooks {
            if let Err(e) = hook(&change) {
                warn!("任务状态观察者执行失败 ({}): {}", change.entity_id, e);
            }
        }
        self.publish(DomainEventPayload::TaskStateChanged {
            task_id: change.entity_id,
            from_status: change.from,
            to_status: change.to,
            timestamp: change.timestamp,
            metadata: change.metadata,
        })
        .await;
    }

    async fn notify_worker(&self, change: WorkerStateChange) {
        let hooks = self.worker_hooks.read().await.clone();
        for hook in hooks {
            if let Err(e) = hook(&change) {
                warn!("Worker状态观察者执行失败 ({}): {}", change.entity_id, e);
            }
        }
        self.publish(DomainEventPayload::WorkerStateChanged {
            worker_id: change.entity_id,
            from_status: change.from,
            to_status: change.to,
            timestamp: change.timestamp,
            metadata: change.metadata,
        })
        .await;
    }

    async fn notify_experiment(&self, change: ExperimentStateChange) {
        let hooks = self.experiment_hooks.read().await.clone();
        for hook in hooks {
            if let Err(e) = hook(&change) {
                warn!("实验状态观察者执行失败 ({}): {}", change.entity_id, e);
            }
        }
        self.publish(DomainEventPayload::ExperimentStateChanged {
            experiment_id: change.entity_id,
            from_status: change.from,
            to_status: change.to,
            timestamp: change.timestamp,
            metadata: change.metadata,
        })
        .await;
    }

    async fn publish(&self, payload: DomainEventPayload) {
        let event = DomainEvent::new(EVENT_SOURCE, payload);
        let event_type = event.event_type.clone();
        if let Err(e) = self.events.publish(event).await {
            warn!("发布事件 {} 失败: {}", event_type, e);
        }
    }
}

fn merge_metadata(target: &mut Metadata, extra: &Metadata) {
    for (key, value) in extra {
        target.insert(key.clone(), value.clone());
    }
}

async fn rollback_quietly(tx: Box<dyn RepositoryTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!("事务回滚失败: {}", e);
    }
}

async fn apply_task_transition(
    tx: &mut dyn RepositoryTransaction,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    transition: TaskTransition,
) -> SchedulerResult<(Task, Metadata)> {
    let mut task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| SchedulerError::task_not_found(task_id))?;

    if task.status != from {
        return Err(SchedulerError::state_mismatch(
            "任务",
            task_id,
            from,
            task.status,
        ));
    }
    if (transition.require_worker_unassigned && task.worker_id.is_some())
        || (transition.require_resource_unassigned && task.compute_resource_id.is_some())
    {
        return Err(SchedulerError::AlreadyAssigned {
            task_id: task_id.to_string(),
        });
    }

    let guard = transition.guard(from);
    let now = Utc::now();
    task.status = to;
    merge_metadata(&mut task.metadata, &transition.metadata);
    if to == TaskStatus::Running && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if to.is_terminal() && task.completed_at.is_none() {
        task.completed_at = Some(now);
        task.duration_ms = task
            .started_at
            .map(|started| (now - started).num_milliseconds());
    }
    // 暂存完成的交接保留Worker，其余入队路径清空分配
    if to == TaskStatus::Queued && from != TaskStatus::DataStaging {
        task.worker_id = None;
        task.compute_resource_id = None;
    }
    if let Some(mutation) = transition.mutation {
        mutation(&mut task);
    }
    task.updated_at = now;

    if !tx.update_task_guarded(&task, guard).await? {
        return Err(SchedulerError::state_mismatch(
            "任务",
            task_id,
            from,
            "已被并发修改",
        ));
    }
    Ok((task, transition.metadata))
}

fn prepare_worker(
    mut worker: Worker,
    from: WorkerStatus,
    to: WorkerStatus,
    metadata: &Metadata,
) -> SchedulerResult<Worker> {
    if worker.status != from {
        return Err(SchedulerError::state_mismatch(
            "Worker",
            &worker.id,
            from,
            worker.status,
        ));
    }

    let now = Utc::now();
    match to {
        WorkerStatus::Busy if worker.current_task_id.is_none() => {
            return Err(SchedulerError::InvalidState(format!(
                "Worker {} 没有当前任务，不能进入BUSY",
                worker.id
            )));
        }
        WorkerStatus::Busy => {}
        WorkerStatus::Idle => worker.current_task_id = None,
        WorkerStatus::Terminated => {
            worker.current_task_id = None;
            worker.terminated_at = Some(now);
        }
    }
    worker.status = to;
    merge_metadata(&mut worker.metadata, metadata);
    worker.updated_at = now;
    Ok(worker)
}

async fn claim_in_transaction(
    tx: &mut dyn RepositoryTransaction,
    task_id: &str,
    worker_id: &str,
) -> SchedulerResult<(Task, Worker)> {
    let mut worker = tx
        .get_worker(worker_id)
        .await?
        .ok_or_else(|| SchedulerError::worker_not_found(worker_id))?;
    if !worker.is_available() {
        return Err(SchedulerError::WorkerUnavailable {
            id: worker_id.to_string(),
        });
    }

    let mut task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| SchedulerError::task_not_found(task_id))?;
    if task.status != TaskStatus::Running {
        return Err(SchedulerError::state_mismatch(
            "任务",
            task_id,
            TaskStatus::Running,
            task.status,
        ));
    }
    if task.worker_id.is_some() {
        return Err(SchedulerError::AlreadyAssigned {
            task_id: task_id.to_string(),
        });
    }
    if task.experiment_id != worker.experiment_id {
        return Err(SchedulerError::InvalidState(format!(
            "任务 {} 不属于Worker {} 的实验",
            task_id, worker_id
        )));
    }

    let now = Utc::now();
    task.worker_id = Some(worker_id.to_string());
    task.updated_at = now;
    let claimed = tx
        .update_task_guarded(
            &task,
            TaskGuard::status(TaskStatus::Running).worker_unassigned(),
        )
        .await?;
    if !claimed {
        return Err(SchedulerError::AlreadyAssigned {
            task_id: task_id.to_string(),
        });
    }

    worker.status = WorkerStatus::Busy;
    worker.current_task_id = Some(task_id.to_string());
    worker.updated_at = now;
    if !tx.update_worker_guarded(&worker, WorkerStatus::Idle).await? {
        return Err(SchedulerError::WorkerUnavailable {
            id: worker_id.to_string(),
        });
    }
    Ok((task, worker))
}

async fn release_in_transaction(
    tx: &mut dyn RepositoryTransaction,
    task_id: &str,
    worker_id: &str,
) -> SchedulerResult<(Task, TaskStatus, Option<Worker>)> {
    let mut task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| SchedulerError::task_not_found(task_id))?;
    if !task.is_assigned_to(worker_id) {
        return Err(SchedulerError::TaskNotAssigned {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }
    let from = task.status;
    if from != TaskStatus::Running && !is_valid_task_transition(from, TaskStatus::Running) {
        return Err(SchedulerError::invalid_transition("任务", from, TaskStatus::Running));
    }

    let now = Utc::now();
    task.status = TaskStatus::Running;
    task.worker_id = None;
    task.metadata.remove("staging_operation_id");
    task.updated_at = now;
    if !tx.update_task_guarded(&task, TaskGuard::status(from)).await? {
        return Err(SchedulerError::state_mismatch("任务", task_id, from, "已被并发修改"));
    }

    let released_worker = match tx.get_worker(worker_id).await? {
        Some(mut worker)
            if worker.status == WorkerStatus::Busy
                && worker.current_task_id.as_deref() == Some(task_id) =>
        {
            worker.status = WorkerStatus::Idle;
            worker.current_task_id = None;
            worker.updated_at = now;
            if !tx.update_worker_guarded(&worker, WorkerStatus::Busy).await? {
                return Err(SchedulerError::state_mismatch(
                    "Worker",
                    worker_id,
                    WorkerStatus::Busy,
                    "已被并发修改",
                ));
            }
            Some(worker)
        }
        _ => None,
    };
    Ok((task, from, released_worker))
}
