//! 调度服务
//!
//! 将实验生成的任务分配到计算资源，并实现Worker拉取任务的分配协议：
//! CREATED -> QUEUED -> RUNNING（已分配计算资源）-> DATA_STAGING -> QUEUED（已分配Worker）
//! -> RUNNING -> {COMPLETED | FAILED}，可重试的失败会回到 QUEUED。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::AppConfig;
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, DataMover, DomainEvent, DomainEventPayload,
    EventHandler, EventPublisher, Experiment, ExperimentRepository, ExperimentStatus,
    FileMetadata, Metadata, Repository, StagingOperationStatus, StagingProgressReporter, Task,
    TaskFilter,
    TaskRepository, TaskStatus, Worker, WorkerFilter, WorkerMetrics, WorkerMetricsRepository,
    WorkerRepository, WorkerStatus, DEFAULT_MAX_RETRIES,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, error, info, warn};

use crate::background_jobs::BackgroundJobManager;
use crate::cost::select_best_task_by_cost;
use crate::optimizer::{CostModel, SchedulingOptimizer, WorkerPoolPlan};
use crate::staging_manager::{MonitorOutcome, StagingOperationManager};
use crate::state_manager::{StateManager, TaskTransition, EVENT_SOURCE};
use crate::worker_failure_detector::WorkerFailureHandler;

/// 计算资源类型的静态偏好分
pub fn resource_desirability(resource: &ComputeResource) -> f64 {
    use scheduler_domain::ComputeResourceType::*;
    match resource.resource_type {
        Slurm => 0.8,
        BareMetal => 1.0,
        Kubernetes => 1.2,
    }
}

/// 按最大Worker数比例划分的Worker分布（仅供参考）
#[derive(Debug, Clone, Default)]
pub struct WorkerDistribution {
    pub experiment_id: String,
    pub workers_per_resource: HashMap<String, i32>,
    pub total_workers: i32,
    pub estimated_cost: f64,
    pub estimated_duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulingPlan {
    pub experiment_id: String,
    pub distribution: WorkerDistribution,
    /// 本次从CREATED转为QUEUED的任务数
    pub queued_tasks: usize,
    /// 本次扫描分配到计算资源的任务数
    pub assigned_tasks: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerStatusInfo {
    pub worker: Worker,
    pub current_task: Option<Task>,
    pub metrics: WorkerMetrics,
    pub heartbeat_age_seconds: i64,
}

/// 将 `task_count` 个任务按最大Worker数的比例分配到各资源，每个资源不超过其上限
pub fn proportional_distribution(
    task_count: usize,
    resources: &[ComputeResource],
) -> HashMap<String, i32> {
    let mut distribution = HashMap::new();
    let capacity: i64 = resources.iter().map(|r| r.max_workers.max(0) as i64).sum();
    if task_count == 0 || capacity == 0 {
        return distribution;
    }

    let target = (task_count as i64).min(capacity);
    let mut remainders = Vec::with_capacity(resources.len());
    let mut assigned = 0i64;
    for (index, resource) in resources.iter().enumerate() {
        let share = target * resource.max_workers.max(0) as i64;
        let workers = share / capacity;
        assigned += workers;
        remainders.push((index, share % capacity));
        distribution.insert(resource.id.clone(), workers as i32);
    }

    // 最大余数法补足剩余名额，余数相同先到先得
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (index, _) in remainders.into_iter().take((target - assigned) as usize) {
        if let Some(workers) = distribution.get_mut(&resources[index].id) {
            *workers += 1;
        }
    }

    distribution.retain(|_, workers| *workers > 0);
    distribution
}

/// 首选资源优先，否则取仍有分配名额的资源中偏好分最高者（同分取先出现的）
fn pick_resource<'a>(
    experiment: &Experiment,
    resources: &'a [ComputeResource],
    distribution: &HashMap<String, i32>,
) -> Option<&'a ComputeResource> {
    if let Some(preferred) = experiment.preferred_resource_id() {
        if let Some(resource) = resources.iter().find(|r| r.id == preferred) {
            return Some(resource);
        }
    }

    let mut best: Option<&ComputeResource> = None;
    for resource in resources {
        if distribution.get(&resource.id).copied().unwrap_or(0) <= 0 {
            continue;
        }
        match best {
            Some(current) if resource_desirability(resource) <= resource_desirability(current) => {}
            _ => best = Some(resource),
        }
    }
    best
}

/// 将实验的每组参数展开为一个CREATED任务
pub fn generate_tasks(experiment: &Experiment, max_retries: i32) -> SchedulerResult<Vec<Task>> {
    if experiment.parameters.is_empty() {
        return Err(SchedulerError::validation_error(format!(
            "实验 {} 没有参数组合，无法生成任务",
            experiment.id
        )));
    }

    let input_files = parse_file_list(experiment.metadata.get("input_files"));
    let output_files = parse_file_list(experiment.metadata.get("output_files"));
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let tasks = experiment
        .parameters
        .iter()
        .enumerate()
        .map(|(index, params)| {
            let command = params.render(&experiment.command_template);
            let mut task = Task::new(&experiment.id, &command);
            task.id = format!("task_{}_{}_{}", experiment.id, index, nanos);
            task.execution_script = Some(command);
            task.max_retries = max_retries;
            task.input_files = input_files.clone();
            task.output_files = output_files.clone();
            for (key, value) in &params.values {
                task.metadata.insert(key.clone(), serde_json::json!(value));
            }
            task
        })
        .collect();
    Ok(tasks)
}

/// 元数据中的文件列表：字符串路径，或 `{path, size, checksum}` 对象
fn parse_file_list(value: Option<&serde_json::Value>) -> Vec<FileMetadata> {
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(path) => Some(FileMetadata::new(path.as_str(), 0, "")),
            serde_json::Value::Object(map) => {
                let path = map.get("path")?.as_str()?;
                let size = map.get("size").and_then(|s| s.as_i64()).unwrap_or(0);
                let checksum = map
                    .get("checksum")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                Some(FileMetadata::new(path, size, checksum))
            }
            _ => None,
        })
        .collect()
}

/// 并发竞争失败（比较并交换未命中）
fn lost_race(e: &SchedulerError) -> bool {
    matches!(
        e,
        SchedulerError::StateMismatch { .. } | SchedulerError::AlreadyAssigned { .. }
    )
}

fn entry(key: &str, value: serde_json::Value) -> Metadata {
    Metadata::from([(key.to_string(), value)])
}

pub struct SchedulerService {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    data_mover: Arc<dyn DataMover>,
    transport: Arc<dyn scheduler_domain::WorkerTransport>,
    state: Arc<StateManager>,
    optimizer: Arc<SchedulingOptimizer>,
    staging: Arc<StagingOperationManager>,
    jobs: Arc<BackgroundJobManager>,
    default_max_retries: i32,
    worker_walltime_seconds: i64,
    shutdown_timeout: Duration,
}

impl SchedulerService {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<dyn EventPublisher>,
        data_mover: Arc<dyn DataMover>,
        transport: Arc<dyn scheduler_domain::WorkerTransport>,
        config: &AppConfig,
    ) -> Self {
        let state = Arc::new(StateManager::new(Arc::clone(&repo), Arc::clone(&events)));
        let optimizer = Arc::new(SchedulingOptimizer::new(
            Arc::clone(&repo),
            CostModel::from(&config.optimizer),
        ));
        let staging = Arc::new(StagingOperationManager::new(
            Arc::clone(&repo),
            Arc::clone(&events),
            config.staging.clone(),
        ));
        let jobs = Arc::new(BackgroundJobManager::new(Duration::from_secs(
            config.scheduler.job_heartbeat_interval_seconds,
        )));

        Self {
            repo,
            events,
            data_mover,
            transport,
            state,
            optimizer,
            staging,
            jobs,
            default_max_retries: config.scheduler.default_max_retries,
            worker_walltime_seconds: config.scheduler.worker_walltime_seconds,
            shutdown_timeout: Duration::from_secs(config.scheduler.shutdown_timeout_seconds),
        }
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn optimizer(&self) -> &Arc<SchedulingOptimizer> {
        &self.optimizer
    }

    pub fn staging_manager(&self) -> &Arc<StagingOperationManager> {
        &self.staging
    }

    pub fn background_jobs(&self) -> &Arc<BackgroundJobManager> {
        &self.jobs
    }

    /// 订阅 `task.queued` 的事件处理器
    pub fn task_queued_handler(self: &Arc<Self>) -> Arc<TaskQueuedHandler> {
        Arc::new(TaskQueuedHandler {
            scheduler: Arc::downgrade(self),
        })
    }

    /// 提交实验：生成任务、进入EXECUTING、计算Worker池方案并执行一次调度
    pub async fn submit_experiment(&self, experiment_id: &str) -> SchedulerResult<WorkerPoolPlan> {
        let experiment = self.load_experiment(experiment_id).await?;
        if experiment.status != ExperimentStatus::Created {
            return Err(SchedulerError::state_mismatch(
                "实验",
                experiment_id,
                ExperimentStatus::Created,
                experiment.status,
            ));
        }
        let resources = self.optimizer.accessible_resources().await?;
        if resources.is_empty() {
            return Err(SchedulerError::NoAvailableResources(format!(
                "无法提交实验 {experiment_id}"
            )));
        }

        let max_retries = if self.default_max_retries >= 0 {
            self.default_max_retries
        } else {
            DEFAULT_MAX_RETRIES
        };
        let tasks = generate_tasks(&experiment, max_retries)?;
        for task in &tasks {
            self.repo.create_task(task).await?;
        }
        info!("实验 {} 生成了 {} 个任务", experiment_id, tasks.len());

        self.state
            .transition_experiment_state(
                experiment_id,
                ExperimentStatus::Created,
                ExperimentStatus::Executing,
                entry("task_count", serde_json::json!(tasks.len())),
            )
            .await?;

        let analysis = self.optimizer.analyze_experiment(experiment_id).await?;
        let plan = self
            .optimizer
            .calculate_optimal_worker_pool(&analysis, &resources)
            .await?;

        self.schedule_experiment(experiment_id).await?;
        Ok(plan)
    }

    /// 将实验的CREATED任务入队，并按资源偏好分配到计算资源
    pub async fn schedule_experiment(&self, experiment_id: &str) -> SchedulerResult<SchedulingPlan> {
        let experiment = self.load_experiment(experiment_id).await?;
        let resources = self.optimizer.accessible_resources().await?;
        if resources.is_empty() {
            return Err(SchedulerError::NoAvailableResources(format!(
                "实验 {experiment_id} 没有可访问的计算资源"
            )));
        }

        let distribution = self.calculate_optimal_distribution(experiment_id).await?;
        let mut plan = SchedulingPlan {
            experiment_id: experiment_id.to_string(),
            distribution,
            ..Default::default()
        };

        let created = self
            .repo
            .list_tasks(&TaskFilter::for_experiment(experiment_id).with_status(TaskStatus::Created))
            .await?;
        for task in &created {
            match self
                .state
                .transition_task_state(&task.id, TaskStatus::Created, TaskStatus::Queued, Metadata::new())
                .await
            {
                Ok(_) => {
                    plan.queued_tasks += 1;
                    self.publish_task_queued(&task.id, experiment_id).await;
                }
                Err(e) if lost_race(&e) => debug!("任务 {} 已被其他流程入队", task.id),
                Err(e) => error!("任务 {} 入队失败: {}", task.id, e),
            }
        }

        let queued = self
            .repo
            .list_tasks(
                &TaskFilter::for_experiment(experiment_id)
                    .with_status(TaskStatus::Queued)
                    .unassigned(),
            )
            .await?;
        for task in queued.iter().filter(|t| t.compute_resource_id.is_none()) {
            let Some(resource) =
                pick_resource(&experiment, &resources, &plan.distribution.workers_per_resource)
            else {
                warn!("任务 {} 没有可用的计算资源", task.id);
                continue;
            };
            match self.assign_to_resource(task, resource).await {
                Ok(()) => plan.assigned_tasks += 1,
                Err(e) if lost_race(&e) => debug!("任务 {} 已被事件处理器分配", task.id),
                Err(e) => error!("任务 {} 分配到计算资源 {} 失败: {}", task.id, resource.id, e),
            }
        }

        info!(
            "实验 {} 调度完成: 入队 {} 个, 分配 {} 个任务",
            experiment_id, plan.queued_tasks, plan.assigned_tasks
        );
        self.publish(DomainEventPayload::SchedulingPlanCreated {
            experiment_id: experiment_id.to_string(),
            worker_distribution: plan.distribution.workers_per_resource.clone(),
            assigned_tasks: plan.assigned_tasks,
            estimated_cost: plan.distribution.estimated_cost,
        })
        .await;
        Ok(plan)
    }

    /// 单个任务的即时资源分配；任务已不在队列或已有计算资源时跳过
    pub async fn process_task(&self, task_id: &str) -> SchedulerResult<bool> {
        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Queued || task.compute_resource_id.is_some() {
            debug!("任务 {} 无需分配 (状态: {})", task_id, task.status);
            return Ok(false);
        }

        let experiment = self.load_experiment(&task.experiment_id).await?;
        let resources = self.optimizer.accessible_resources().await?;
        let open: HashMap<String, i32> = resources
            .iter()
            .map(|r| (r.id.clone(), r.max_workers))
            .collect();
        let Some(resource) = pick_resource(&experiment, &resources, &open) else {
            warn!("任务 {} 暂无可用的计算资源，等待下次调度", task_id);
            return Ok(false);
        };

        match self.assign_to_resource(&task, resource).await {
            Ok(()) => Ok(true),
            Err(e) if lost_race(&e) => {
                debug!("任务 {} 已被其他流程分配", task_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn assign_to_resource(&self, task: &Task, resource: &ComputeResource) -> SchedulerResult<()> {
        let resource_id = resource.id.clone();
        self.state
            .transition_task_state_with(
                &task.id,
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskTransition::new()
                    .with_entry("compute_resource_id", serde_json::json!(resource_id))
                    .require_worker_unassigned()
                    .require_resource_unassigned()
                    .mutate(move |t| t.compute_resource_id = Some(resource_id)),
            )
            .await?;

        debug!("任务 {} 已分配到计算资源 {}", task.id, resource.id);
        self.publish(DomainEventPayload::TaskAssigned {
            task_id: task.id.clone(),
            experiment_id: task.experiment_id.clone(),
            compute_resource_id: Some(resource.id.clone()),
            worker_id: None,
        })
        .await;
        Ok(())
    }

    /// Worker拉取任务；没有可分配的任务时返回 None
    pub async fn assign_task(&self, worker_id: &str) -> SchedulerResult<Option<Task>> {
        self.claim_best_task(worker_id).await
    }

    async fn claim_best_task(&self, worker_id: &str) -> SchedulerResult<Option<Task>> {
        let worker = self.load_worker(worker_id).await?;
        if !worker.is_available() {
            return Err(SchedulerError::WorkerUnavailable {
                id: worker_id.to_string(),
            });
        }

        let candidates = self
            .repo
            .list_tasks(
                &TaskFilter::for_experiment(&worker.experiment_id)
                    .with_status(TaskStatus::Running)
                    .on_resource(&worker.compute_resource_id)
                    .unassigned(),
            )
            .await?;
        if candidates.is_empty() {
            debug!("Worker {} 暂无可分配的任务", worker_id);
            return Ok(None);
        }

        let resource = self
            .repo
            .get_compute_resource(&worker.compute_resource_id)
            .await?
            .ok_or_else(|| SchedulerError::compute_resource_not_found(&worker.compute_resource_id))?;
        let metrics = self.get_worker_metrics(worker_id).await?;
        let Some((best, score)) = select_best_task_by_cost(&candidates, &resource, &metrics, Utc::now())
        else {
            return Ok(None);
        };
        debug!("为Worker {} 选择任务 {} (评分 {:.3})", worker_id, best.id, score);

        let (task, _) = self.state.claim_task_for_worker(&best.id, worker_id).await?;
        self.publish(DomainEventPayload::TaskAssigned {
            task_id: task.id.clone(),
            experiment_id: task.experiment_id.clone(),
            compute_resource_id: task.compute_resource_id.clone(),
            worker_id: Some(worker_id.to_string()),
        })
        .await;
        Ok(Some(task))
    }

    /// 分配任务并为其输入数据启动预取暂存
    ///
    /// 暂存在受跟踪的后台任务中监控，完成后任务回到QUEUED（保留Worker）等待执行。
    pub async fn assign_task_with_staging(
        self: &Arc<Self>,
        worker_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        if self.jobs.is_shutting_down() || self.staging.is_shutting_down() {
            return Err(SchedulerError::InvalidState("调度器正在关闭".to_string()));
        }
        let Some(task) = self.claim_best_task(worker_id).await? else {
            return Ok(None);
        };

        match self.begin_staging(&task, worker_id).await {
            Ok(staged) => Ok(Some(staged)),
            Err(e) => {
                error!("任务 {} 启动数据暂存失败，撤销认领: {}", task.id, e);
                if let Err(release_err) = self.state.release_claim(&task.id, worker_id).await {
                    error!("撤销任务 {} 的认领失败: {}", task.id, release_err);
                }
                Err(e)
            }
        }
    }

    async fn begin_staging(self: &Arc<Self>, task: &Task, worker_id: &str) -> SchedulerResult<Task> {
        let resource_id = task
            .compute_resource_id
            .clone()
            .ok_or_else(|| SchedulerError::InvalidState(format!("任务 {} 未分配计算资源", task.id)))?;

        let op = self.staging.create(task, worker_id, &resource_id).await?;
        let staged = self
            .state
            .transition_task_state_with(
                &task.id,
                TaskStatus::Running,
                TaskStatus::DataStaging,
                TaskTransition::new().with_entry("staging_operation_id", serde_json::json!(op.id)),
            )
            .await;
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                self.abandon_staging(&op.id, &e).await;
                return Err(e);
            }
        };

        let started = self.staging.start(&op.id).await;
        let started = match started {
            Ok(op) => op,
            Err(e) => {
                self.abandon_staging(&op.id, &e).await;
                return Err(e);
            }
        };
        let reporter: Arc<dyn StagingProgressReporter> = self.staging.clone();
        if let Err(e) = self
            .data_mover
            .begin_proactive_staging(&staged, &started, reporter)
            .await
        {
            self.abandon_staging(&op.id, &e).await;
            return Err(e);
        }

        if let Err(e) = self.spawn_staging_monitor(&op.id, &task.id, worker_id).await {
            self.abandon_staging(&op.id, &e).await;
            return Err(e);
        }

        info!("任务 {} 开始数据暂存 (操作: {})", task.id, op.id);
        Ok(staged)
    }

    /// 暂存启动中途出错时把操作标记为失败，失败本身只记录日志
    async fn abandon_staging(&self, operation_id: &str, cause: &SchedulerError) {
        if let Err(e) = self.staging.fail(operation_id, &cause.to_string()).await {
            warn!("标记暂存操作 {} 失败时出错: {}", operation_id, e);
        }
    }

    async fn spawn_staging_monitor(
        self: &Arc<Self>,
        operation_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> SchedulerResult<()> {
        let scheduler = Arc::clone(self);
        let task_id = task_id.to_string();
        let worker = worker_id.to_string();
        let operation_id = operation_id.to_string();
        self.jobs
            .spawn("staging-monitor", async move {
                scheduler
                    .run_staging_monitor(&operation_id, &task_id, &worker)
                    .await
            })
            .await
            .map(|_| ())
    }

    /// 启动时恢复未完成的暂存操作
    ///
    /// 仍在传输的操作重新挂上监控；恢复时已超时的操作使其任务按失败处理。
    /// 返回重新监控的操作数。
    pub async fn resume_staging(self: &Arc<Self>) -> SchedulerResult<usize> {
        let incomplete = self.staging.list_incomplete().await?;
        if incomplete.is_empty() {
            return Ok(0);
        }
        info!("发现 {} 个未完成的暂存操作，开始恢复", incomplete.len());

        let mut monitored = 0;
        for op in incomplete {
            let resumed = match self.staging.resume(&op.id).await {
                Ok(resumed) => resumed,
                Err(e) => {
                    error!("恢复暂存操作 {} 失败: {}", op.id, e);
                    continue;
                }
            };
            match resumed.status {
                StagingOperationStatus::Running => {
                    self.spawn_staging_monitor(&resumed.id, &resumed.task_id, &resumed.worker_id)
                        .await?;
                    monitored += 1;
                }
                StagingOperationStatus::Failed | StagingOperationStatus::Timeout => {
                    let message = resumed.error_message.unwrap_or_default();
                    if let Err(e) = self
                        .fail_after_staging(&resumed.task_id, &resumed.worker_id, &message)
                        .await
                    {
                        error!("处理暂存超时的任务 {} 失败: {}", resumed.task_id, e);
                    }
                }
                _ => {}
            }
        }
        Ok(monitored)
    }

    async fn run_staging_monitor(
        &self,
        operation_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> SchedulerResult<()> {
        let outcome = self
            .staging
            .monitor(operation_id, || async move {
                self.on_staging_complete(task_id).await.map(|_| ())
            })
            .await?;

        match outcome {
            MonitorOutcome::Completed | MonitorOutcome::Interrupted => Ok(()),
            MonitorOutcome::Failed(message) => self.fail_after_staging(task_id, worker_id, &message).await,
            MonitorOutcome::TimedOut => {
                self.fail_after_staging(task_id, worker_id, "数据暂存超时")
                    .await
            }
        }
    }

    async fn fail_after_staging(
        &self,
        task_id: &str,
        worker_id: &str,
        message: &str,
    ) -> SchedulerResult<()> {
        let task = self.load_task(task_id).await?;
        if task.is_terminal() || !task.is_assigned_to(worker_id) {
            return Ok(());
        }
        self.fail_task(task_id, worker_id, &format!("数据暂存失败: {message}"))
            .await
            .map(|_| ())
    }

    /// 暂存完成：DATA_STAGING -> QUEUED，保留已分配的Worker
    pub async fn on_staging_complete(&self, task_id: &str) -> SchedulerResult<Task> {
        let task = self
            .state
            .transition_task_state(
                task_id,
                TaskStatus::DataStaging,
                TaskStatus::Queued,
                entry("staging_completed", serde_json::json!(true)),
            )
            .await?;
        info!("任务 {} 数据暂存完成，等待Worker {:?} 执行", task_id, task.worker_id);
        Ok(task)
    }

    /// Worker上报的执行进度（例如 QUEUED -> RUNNING、RUNNING -> OUTPUT_STAGING）
    pub async fn update_task_status(
        &self,
        task_id: &str,
        worker_id: &str,
        to: TaskStatus,
        metadata: Metadata,
    ) -> SchedulerResult<Task> {
        let task = self.load_task(task_id).await?;
        if !task.is_assigned_to(worker_id) {
            return Err(SchedulerError::TaskNotAssigned {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }

        match to {
            TaskStatus::Completed => {
                let result = metadata
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                self.complete_task(task_id, worker_id, result).await
            }
            TaskStatus::Failed => {
                let error = metadata
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Worker报告任务失败")
                    .to_string();
                self.fail_task(task_id, worker_id, &error).await
            }
            TaskStatus::Queued | TaskStatus::Created | TaskStatus::Canceled => {
                Err(SchedulerError::InvalidState(format!(
                    "Worker不能将任务 {task_id} 置为 {to}"
                )))
            }
            _ => {
                self.state
                    .transition_task_state(task_id, task.status, to, metadata)
                    .await
            }
        }
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        result: Option<String>,
    ) -> SchedulerResult<Task> {
        let task = self.load_task(task_id).await?;
        if !task.is_assigned_to(worker_id) {
            return Err(SchedulerError::TaskNotAssigned {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }

        let completed = self
            .state
            .transition_task_state_with(
                task_id,
                task.status,
                TaskStatus::Completed,
                TaskTransition::new()
                    .with_entry("worker_id", serde_json::json!(worker_id))
                    .mutate(move |t| {
                        if result.is_some() {
                            t.result_summary = result;
                        }
                    }),
            )
            .await?;

        self.release_worker(worker_id, task_id, "task_completed").await;
        info!("任务 {} 已由Worker {} 完成", task_id, worker_id);
        self.publish(DomainEventPayload::TaskCompleted {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            duration_ms: completed.duration_ms,
        })
        .await;

        self.check_experiment_completion(&completed.experiment_id)
            .await?;
        Ok(completed)
    }

    /// 任务失败：重试次数加一，未达上限则重新入队，否则永久失败
    pub async fn fail_task(
        &self,
        task_id: &str,
        worker_id: &str,
        error_message: &str,
    ) -> SchedulerResult<Task> {
        let task = self.load_task(task_id).await?;
        if !task.is_assigned_to(worker_id) {
            return Err(SchedulerError::TaskNotAssigned {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }

        let attempts = task.retry_count + 1;
        let will_retry = attempts < task.max_retries;
        let failed = if will_retry {
            self.state
                .requeue_task(task_id, true, Some(error_message.to_string()))
                .await?
        } else {
            let message = error_message.to_string();
            self.state
                .transition_task_state_with(
                    task_id,
                    task.status,
                    TaskStatus::Failed,
                    TaskTransition::new()
                        .with_entry("worker_id", serde_json::json!(worker_id))
                        .with_entry("error", serde_json::json!(error_message))
                        .mutate(move |t| {
                            t.retry_count += 1;
                            t.error = Some(message);
                        }),
                )
                .await?
        };

        self.release_worker(worker_id, task_id, "task_failed").await;
        warn!(
            "任务 {} 在Worker {} 上失败 (第 {} 次, 重试: {}): {}",
            task_id, worker_id, failed.retry_count, will_retry, error_message
        );
        self.publish(DomainEventPayload::TaskFailed {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            error: error_message.to_string(),
            retry_count: failed.retry_count,
            will_retry,
        })
        .await;

        if will_retry {
            self.publish_task_queued(task_id, &failed.experiment_id).await;
        } else {
            self.check_experiment_completion(&failed.experiment_id)
                .await?;
        }
        Ok(failed)
    }

    /// Worker失联：重新入队其当前任务并将Worker置回IDLE
    pub async fn handle_worker_failure(&self, worker_id: &str) -> SchedulerResult<Option<Task>> {
        let worker = self.load_worker(worker_id).await?;
        if worker.status == WorkerStatus::Terminated {
            debug!("Worker {} 已终止，忽略失效报告", worker_id);
            return Ok(None);
        }

        let mut requeued = None;
        if let Some(task_id) = worker.current_task_id.as_deref() {
            // 任务重新入队失败也要继续复位Worker
            match self.requeue_orphaned_task(worker_id, task_id).await {
                Ok(task) => requeued = task,
                Err(e) => error!(
                    "Worker {} 失效后重新入队任务 {} 失败: {}",
                    worker_id, task_id, e
                ),
            }
        }

        if worker.status == WorkerStatus::Busy {
            self.state
                .transition_worker_state(
                    worker_id,
                    WorkerStatus::Busy,
                    WorkerStatus::Idle,
                    entry("reason", serde_json::json!("worker_failed")),
                )
                .await?;
        }

        warn!(
            "已处理Worker {} 失效，重新入队任务: {:?}",
            worker_id,
            requeued.as_ref().map(|t| t.id.as_str())
        );
        self.publish(DomainEventPayload::WorkerFailed {
            worker_id: worker_id.to_string(),
            requeued_task_id: requeued.as_ref().map(|t| t.id.clone()),
        })
        .await;
        Ok(requeued)
    }

    async fn requeue_orphaned_task(
        &self,
        worker_id: &str,
        task_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        match self.repo.get_task(task_id).await? {
            Some(task) if task.is_assigned_to(worker_id) && !task.is_terminal() => {
                let task = self
                    .state
                    .requeue_task(task_id, false, Some(format!("Worker {worker_id} 失效")))
                    .await?;
                self.publish_task_queued(&task.id, &task.experiment_id).await;
                Ok(Some(task))
            }
            _ => {
                debug!("Worker {} 的当前任务 {} 无需重新入队", worker_id, task_id);
                Ok(None)
            }
        }
    }

    /// 按最大Worker数比例估算实验的Worker分布（按每小时费用、1小时计）
    pub async fn calculate_optimal_distribution(
        &self,
        experiment_id: &str,
    ) -> SchedulerResult<WorkerDistribution> {
        self.load_experiment(experiment_id).await?;
        let resources = self.optimizer.accessible_resources().await?;
        let pending = self
            .repo
            .list_tasks(&TaskFilter::for_experiment(experiment_id))
            .await?
            .into_iter()
            .filter(|t| !t.is_terminal())
            .count();

        let workers_per_resource = proportional_distribution(pending, &resources);
        let total_workers = workers_per_resource.values().sum();
        let estimated_cost = resources
            .iter()
            .map(|r| workers_per_resource.get(&r.id).copied().unwrap_or(0) as f64 * r.cost_per_hour)
            .sum();
        let estimated_duration = if total_workers > 0 {
            Duration::from_secs(3600)
        } else {
            Duration::ZERO
        };

        Ok(WorkerDistribution {
            experiment_id: experiment_id.to_string(),
            workers_per_resource,
            total_workers,
            estimated_cost,
            estimated_duration,
        })
    }

    /// 为方案中的每个资源创建IDLE的Worker记录（进程的启动由外部完成）
    pub async fn provision_worker_pool(
        &self,
        experiment_id: &str,
        plan: &WorkerPoolPlan,
    ) -> SchedulerResult<Vec<Worker>> {
        let experiment = self.load_experiment(experiment_id).await?;
        let mut entries: Vec<(&String, &i32)> = plan.workers_per_resource.iter().collect();
        entries.sort();

        let mut created = Vec::new();
        for (resource_id, count) in entries {
            let mut resource = self
                .repo
                .get_compute_resource(resource_id)
                .await?
                .ok_or_else(|| SchedulerError::compute_resource_not_found(resource_id.as_str()))?;

            let mut added = 0;
            for index in 0..*count {
                let worker_id = format!("worker-{}-{}-{}", experiment_id, resource_id, index);
                if self.repo.get_worker(&worker_id).await?.is_some() {
                    continue;
                }
                let mut worker = Worker::new(&worker_id, resource_id.as_str(), experiment_id);
                worker.user_id = Some(experiment.owner_id.clone());
                worker.walltime_seconds = self.worker_walltime_seconds;
                worker.walltime_remaining_seconds = self.worker_walltime_seconds;
                self.repo.create_worker(&worker).await?;
                created.push(worker);
                added += 1;
            }

            if added > 0 {
                resource.current_workers += added;
                resource.updated_at = Utc::now();
                self.repo.update_compute_resource(&resource).await?;
                info!("在计算资源 {} 上为实验 {} 预配了 {} 个Worker", resource_id, experiment_id, added);
            }
        }
        Ok(created)
    }

    /// Worker的历史表现与最近一次资源使用采样
    pub async fn get_worker_metrics(&self, worker_id: &str) -> SchedulerResult<WorkerMetrics> {
        self.load_worker(worker_id).await?;
        let history = self
            .repo
            .list_tasks(
                &TaskFilter::default()
                    .for_worker(worker_id)
                    .with_statuses(&[TaskStatus::Completed, TaskStatus::Failed]),
            )
            .await?;

        let mut metrics = match self.repo.get_latest_worker_metrics(worker_id).await? {
            Some(latest) => WorkerMetrics::sample(
                worker_id,
                latest.cpu_usage_percent,
                latest.memory_usage_percent,
            ),
            None => WorkerMetrics::sample(worker_id, 0.0, 0.0),
        };

        let mut total_duration = 0i64;
        let mut timed = 0i64;
        for task in &history {
            match task.status {
                TaskStatus::Completed => {
                    metrics.tasks_completed += 1;
                    if let Some(duration) = task.duration_ms {
                        total_duration += duration;
                        timed += 1;
                    }
                }
                TaskStatus::Failed => metrics.tasks_failed += 1,
                _ => {}
            }
        }
        if timed > 0 {
            metrics.average_task_duration_ms = total_duration / timed;
        }
        Ok(metrics)
    }

    /// 处理Worker心跳：刷新心跳时间、记录资源使用采样
    pub async fn update_worker_metrics(
        &self,
        worker_id: &str,
        cpu_usage_percent: f64,
        memory_usage_percent: f64,
    ) -> SchedulerResult<()> {
        for usage in [cpu_usage_percent, memory_usage_percent] {
            if !usage.is_finite() || !(0.0..=100.0).contains(&usage) {
                return Err(SchedulerError::validation_error(format!(
                    "资源使用率必须在0到100之间: {usage}"
                )));
            }
        }

        self.touch_heartbeat(worker_id).await?;
        self.repo
            .record_worker_metrics(&WorkerMetrics::sample(
                worker_id,
                cpu_usage_percent,
                memory_usage_percent,
            ))
            .await?;

        self.publish(DomainEventPayload::WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            cpu_usage_percent,
            memory_usage_percent,
        })
        .await;
        Ok(())
    }

    async fn touch_heartbeat(&self, worker_id: &str) -> SchedulerResult<()> {
        const MAX_ATTEMPTS: usize = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut tx = self.repo.begin().await?;
            let Some(mut worker) = tx.get_worker(worker_id).await? else {
                tx.rollback().await?;
                return Err(SchedulerError::worker_not_found(worker_id));
            };

            let now = Utc::now();
            let elapsed = (now - worker.registered_at).num_seconds().max(0);
            worker.last_heartbeat = now;
            worker.walltime_remaining_seconds = (worker.walltime_seconds - elapsed).max(0);
            worker.updated_at = now;
            let expected = worker.status;
            if tx.update_worker_guarded(&worker, expected).await? {
                tx.commit().await?;
                return Ok(());
            }
            tx.rollback().await?;
            debug!("Worker {} 心跳写入冲突，第 {} 次重试", worker_id, attempt);
        }
        Err(SchedulerError::state_mismatch(
            "Worker",
            worker_id,
            "心跳写入",
            "已被并发修改",
        ))
    }

    pub async fn get_worker_status(&self, worker_id: &str) -> SchedulerResult<WorkerStatusInfo> {
        let worker = self.load_worker(worker_id).await?;
        let current_task = match worker.current_task_id.as_deref() {
            Some(task_id) => self.repo.get_task(task_id).await?,
            None => None,
        };
        let metrics = self.get_worker_metrics(worker_id).await?;
        let heartbeat_age_seconds = worker.heartbeat_age(Utc::now()).num_seconds();
        Ok(WorkerStatusInfo {
            worker,
            current_task,
            metrics,
            heartbeat_age_seconds,
        })
    }

    /// 实验的任务全部结束时推进实验状态并关闭其Worker
    async fn check_experiment_completion(
        &self,
        experiment_id: &str,
    ) -> SchedulerResult<Option<ExperimentStatus>> {
        let tasks = self
            .repo
            .list_tasks(&TaskFilter::for_experiment(experiment_id))
            .await?;
        if tasks.is_empty() || tasks.iter().any(|t| !t.is_terminal()) {
            return Ok(None);
        }

        let experiment = self.load_experiment(experiment_id).await?;
        if experiment.status != ExperimentStatus::Executing {
            return Ok(None);
        }

        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let to = if failed == 0 {
            ExperimentStatus::Completed
        } else {
            ExperimentStatus::Canceled
        };

        let mut metadata = entry("total_tasks", serde_json::json!(tasks.len()));
        metadata.insert("failed_tasks".to_string(), serde_json::json!(failed));
        match self
            .state
            .transition_experiment_state(experiment_id, ExperimentStatus::Executing, to, metadata)
            .await
        {
            Ok(_) => {}
            Err(e) if lost_race(&e) => {
                debug!("实验 {} 已由其他流程结束", experiment_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        if failed == 0 {
            info!("实验 {} 的 {} 个任务全部完成", experiment_id, tasks.len());
            self.publish(DomainEventPayload::ExperimentCompleted {
                experiment_id: experiment_id.to_string(),
                total_tasks: tasks.len(),
            })
            .await;
        } else {
            warn!("实验 {} 结束，{} 个任务永久失败", experiment_id, failed);
            self.publish(DomainEventPayload::ExperimentFailed {
                experiment_id: experiment_id.to_string(),
                total_tasks: tasks.len(),
                failed_tasks: failed,
            })
            .await;
        }

        self.shutdown_experiment_workers(experiment_id, failed > 0)
            .await?;
        Ok(Some(to))
    }

    async fn shutdown_experiment_workers(
        &self,
        experiment_id: &str,
        has_failures: bool,
    ) -> SchedulerResult<()> {
        let workers = self
            .repo
            .list_workers(
                &WorkerFilter::for_experiment(experiment_id)
                    .with_statuses(&[WorkerStatus::Idle, WorkerStatus::Busy]),
            )
            .await?;
        let reason = if has_failures {
            "实验因任务失败而取消"
        } else {
            "实验已完成"
        };

        for worker in workers {
            if let Err(e) = self.transport.shutdown_worker(&worker.id, reason, true).await {
                error!("通知Worker {} 关闭失败: {}", worker.id, e);
            }
            if let Err(e) = self
                .state
                .transition_worker_state(
                    &worker.id,
                    worker.status,
                    WorkerStatus::Terminated,
                    entry("reason", serde_json::json!(reason)),
                )
                .await
            {
                warn!("终止Worker {} 失败: {}", worker.id, e);
            }
        }
        Ok(())
    }

    /// 任务结束后将仍持有该任务的Worker置回IDLE
    async fn release_worker(&self, worker_id: &str, task_id: &str, reason: &str) {
        let worker = match self.repo.get_worker(worker_id).await {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                warn!("Worker {} 不存在，无法释放", worker_id);
                return;
            }
            Err(e) => {
                warn!("读取Worker {} 失败: {}", worker_id, e);
                return;
            }
        };
        if worker.status != WorkerStatus::Busy || worker.current_task_id.as_deref() != Some(task_id) {
            return;
        }

        let mut metadata = entry("task_id", serde_json::json!(task_id));
        metadata.insert("reason".to_string(), serde_json::json!(reason));
        if let Err(e) = self
            .state
            .transition_worker_state(worker_id, WorkerStatus::Busy, WorkerStatus::Idle, metadata)
            .await
        {
            warn!("Worker {} 回到IDLE失败: {}", worker_id, e);
        }
    }

    /// 通知所有后台循环停止，并等待暂存管理器与后台任务结束
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        info!("调度服务开始关闭");
        self.staging.shutdown().await;
        self.jobs.shutdown(self.shutdown_timeout).await?;
        info!("调度服务已关闭");
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> SchedulerResult<Task> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    async fn load_worker(&self, worker_id: &str) -> SchedulerResult<Worker> {
        self.repo
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| SchedulerError::worker_not_found(worker_id))
    }

    async fn load_experiment(&self, experiment_id: &str) -> SchedulerResult<Experiment> {
        self.repo
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| SchedulerError::experiment_not_found(experiment_id))
    }

    async fn publish_task_queued(&self, task_id: &str, experiment_id: &str) {
        self.publish(DomainEventPayload::TaskQueued {
            task_id: task_id.to_string(),
            experiment_id: experiment_id.to_string(),
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

#[async_trait]
impl WorkerFailureHandler for SchedulerService {
    async fn handle_worker_failure(&self, worker_id: &str) -> SchedulerResult<()> {
        SchedulerService::handle_worker_failure(self, worker_id)
            .await
            .map(|_| ())
    }
}

/// `task.queued` 事件处理器：立即为新入队的任务分配计算资源
pub struct TaskQueuedHandler {
    scheduler: Weak<SchedulerService>,
}

#[async_trait]
impl EventHandler for TaskQueuedHandler {
    async fn handle(&self, event: &DomainEvent) -> SchedulerResult<()> {
        let DomainEventPayload::TaskQueued { task_id, .. } = &event.data else {
            return Ok(());
        };
        let Some(scheduler) = self.scheduler.upgrade() else {
            debug!("调度服务已释放，忽略事件 {}", event.id);
            return Ok(());
        };

        match scheduler.process_task(task_id).await {
            Ok(true) => {
                debug!("事件驱动分配任务 {} 成功", task_id);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("任务 {} 已不存在: {}", task_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "task_queued_handler"
    }
}
