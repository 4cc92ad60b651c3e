//! Worker池规模优化
//!
//! 按数据本地性与当前队列深度为每个计算资源打分，决定为实验预配多少Worker，
//! 并用可调的成本模型给出费用估算。总Worker数始终小于任务数（单任务时恰为1）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::OptimizerConfig;
use scheduler_domain::locality::{is_file_colocated, task_fully_colocated};
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, ComputeResourceStatus, ComputeResourceType,
    ExperimentRepository, Repository, Task, TaskFilter, TaskRepository, TaskStatus,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info};

const LOCALITY_WEIGHT: f64 = 0.6;
const QUEUE_WEIGHT: f64 = 0.4;
const TASKS_PER_WORKER: f64 = 3.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// 仍占用计算资源队列的任务状态
const QUEUE_STATUSES: &[TaskStatus] = &[
    TaskStatus::Queued,
    TaskStatus::DataStaging,
    TaskStatus::EnvSetup,
    TaskStatus::Running,
    TaskStatus::OutputStaging,
];

/// 计费参数；默认值只是便于调整的估算，不代表实际账单
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    pub base_worker_cost_per_hour: f64,
    pub cpu_cost_per_core_hour: f64,
    pub memory_cost_per_gb_hour: f64,
    pub gpu_cost_per_hour: f64,
    pub data_transfer_cost_per_gb: f64,
    pub assumed_walltime_hours: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::from(&OptimizerConfig::default())
    }
}

impl From<&OptimizerConfig> for CostModel {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            base_worker_cost_per_hour: config.base_worker_cost_per_hour,
            cpu_cost_per_core_hour: config.cpu_cost_per_core_hour,
            memory_cost_per_gb_hour: config.memory_cost_per_gb_hour,
            gpu_cost_per_hour: config.gpu_cost_per_hour,
            data_transfer_cost_per_gb: config.data_transfer_cost_per_gb,
            assumed_walltime_hours: config.assumed_walltime_hours,
        }
    }
}

/// 资源类型的成本系数
pub fn resource_type_multiplier(resource_type: ComputeResourceType) -> f64 {
    match resource_type {
        ComputeResourceType::Slurm => 0.8,
        ComputeResourceType::Kubernetes => 1.2,
        ComputeResourceType::BareMetal => 1.0,
    }
}

/// 实验的计算需求分析
#[derive(Debug, Clone)]
pub struct ExperimentAnalysis {
    pub experiment_id: String,
    pub total_tasks: usize,
    pub cpu_cores_per_task: i32,
    pub memory_mb_per_task: i64,
    pub gpus_per_task: i32,
    pub total_input_bytes: i64,
    /// 计算资源ID -> 输入全部与之同址的任务比例
    pub data_locality: HashMap<String, f64>,
    /// 计算资源ID -> 不在该资源本地的输入字节数
    pub remote_input_bytes: HashMap<String, i64>,
}

impl ExperimentAnalysis {
    /// 由任务和候选资源直接构建
    pub fn from_tasks(
        experiment_id: &str,
        tasks: &[Task],
        resources: &[ComputeResource],
        cpu_cores_per_task: i32,
        memory_mb_per_task: i64,
        gpus_per_task: i32,
    ) -> Self {
        let mut data_locality = HashMap::new();
        let mut remote_input_bytes = HashMap::new();
        for resource in resources {
            let colocated = tasks
                .iter()
                .filter(|t| task_fully_colocated(t, resource))
                .count();
            let fraction = if tasks.is_empty() {
                0.0
            } else {
                colocated as f64 / tasks.len() as f64
            };
            let remote: i64 = tasks
                .iter()
                .flat_map(|t| t.input_files.iter())
                .filter(|f| !is_file_colocated(f, resource))
                .map(|f| f.size)
                .sum();
            data_locality.insert(resource.id.clone(), fraction);
            remote_input_bytes.insert(resource.id.clone(), remote);
        }

        Self {
            experiment_id: experiment_id.to_string(),
            total_tasks: tasks.len(),
            cpu_cores_per_task: cpu_cores_per_task.max(1),
            memory_mb_per_task: if memory_mb_per_task > 0 {
                memory_mb_per_task
            } else {
                1024
            },
            gpus_per_task: gpus_per_task.max(0),
            total_input_bytes: tasks.iter().map(Task::total_input_size).sum(),
            data_locality,
            remote_input_bytes,
        }
    }

    pub fn locality_for(&self, resource_id: &str) -> f64 {
        self.data_locality.get(resource_id).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerPoolPlan {
    pub experiment_id: String,
    pub workers_per_resource: HashMap<String, i32>,
    pub total_workers: i32,
    pub total_tasks: usize,
    pub estimated_cost: f64,
    pub estimated_duration: Duration,
    pub resource_costs: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
struct ScoredResource {
    resource: ComputeResource,
    score: f64,
}

pub struct SchedulingOptimizer {
    repo: Arc<dyn Repository>,
    cost_model: CostModel,
}

impl SchedulingOptimizer {
    pub fn new(repo: Arc<dyn Repository>, cost_model: CostModel) -> Self {
        Self { repo, cost_model }
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    /// 加载实验、任务与可用资源并分析计算需求
    pub async fn analyze_experiment(&self, experiment_id: &str) -> SchedulerResult<ExperimentAnalysis> {
        let experiment = self
            .repo
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| SchedulerError::experiment_not_found(experiment_id))?;
        let tasks = self
            .repo
            .list_tasks(&TaskFilter::for_experiment(experiment_id))
            .await?;
        let resources = self.accessible_resources().await?;

        let requirements = &experiment.requirements;
        let analysis = ExperimentAnalysis::from_tasks(
            experiment_id,
            &tasks,
            &resources,
            requirements.cpu_cores,
            requirements.memory_mb,
            requirements.gpus,
        );
        debug!(
            "实验 {} 分析完成: {} 个任务, 每任务 {} 核 / {} MB / {} GPU, 输入 {} 字节",
            experiment_id,
            analysis.total_tasks,
            analysis.cpu_cores_per_task,
            analysis.memory_mb_per_task,
            analysis.gpus_per_task,
            analysis.total_input_bytes
        );
        Ok(analysis)
    }

    pub async fn accessible_resources(&self) -> SchedulerResult<Vec<ComputeResource>> {
        Ok(self
            .repo
            .list_compute_resources(Some(ComputeResourceStatus::Active))
            .await?
            .into_iter()
            .filter(ComputeResource::is_accessible)
            .collect())
    }

    /// 计算资源当前的队列深度
    pub async fn queue_depth(&self, resource_id: &str) -> SchedulerResult<usize> {
        let tasks = self
            .repo
            .list_tasks(
                &TaskFilter::default()
                    .on_resource(resource_id)
                    .with_statuses(QUEUE_STATUSES),
            )
            .await?;
        Ok(tasks.len())
    }

    pub async fn calculate_optimal_worker_pool(
        &self,
        analysis: &ExperimentAnalysis,
        resources: &[ComputeResource],
    ) -> SchedulerResult<WorkerPoolPlan> {
        let accessible: Vec<&ComputeResource> =
            resources.iter().filter(|r| r.is_accessible()).collect();
        if accessible.is_empty() {
            return Err(SchedulerError::NoAvailableResources(format!(
                "实验 {} 没有可访问的计算资源",
                analysis.experiment_id
            )));
        }

        let mut plan = WorkerPoolPlan {
            experiment_id: analysis.experiment_id.clone(),
            total_tasks: analysis.total_tasks,
            ..Default::default()
        };
        if analysis.total_tasks == 0 {
            return Ok(plan);
        }

        let mut scored = Vec::with_capacity(accessible.len());
        for resource in accessible {
            let depth = self.queue_depth(&resource.id).await?;
            let locality = analysis.locality_for(&resource.id);
            let queue_score = 1.0 / (depth as f64 + 1.0);
            let score = LOCALITY_WEIGHT * locality + QUEUE_WEIGHT * queue_score;
            debug!(
                "资源 {} 评分: 本地性 {:.2}, 队列深度 {}, 总分 {:.3}",
                resource.id, locality, depth, score
            );
            scored.push(ScoredResource {
                resource: resource.clone(),
                score,
            });
        }

        let allocation = allocate_workers(&scored, analysis.total_tasks);
        self.fill_plan(&mut plan, analysis, &scored, allocation);

        info!(
            "实验 {} 的Worker池方案: {} 个Worker / {} 个任务, 预计费用 {:.2}",
            plan.experiment_id, plan.total_workers, plan.total_tasks, plan.estimated_cost
        );
        Ok(plan)
    }

    fn fill_plan(
        &self,
        plan: &mut WorkerPoolPlan,
        analysis: &ExperimentAnalysis,
        scored: &[ScoredResource],
        allocation: HashMap<String, i32>,
    ) {
        let total_workers: i32 = allocation.values().sum();
        for entry in scored {
            let Some(&workers) = allocation.get(&entry.resource.id) else {
                continue;
            };
            let cost = self.estimate_resource_cost(&entry.resource, workers, total_workers, analysis);
            plan.resource_costs.insert(entry.resource.id.clone(), cost);
            plan.estimated_cost += cost;
        }

        plan.total_workers = total_workers;
        plan.workers_per_resource = allocation;
        if total_workers > 0 {
            let rounds = (analysis.total_tasks as f64 / total_workers as f64).ceil();
            plan.estimated_duration =
                Duration::from_secs_f64(rounds * self.cost_model.assumed_walltime_hours * 3600.0);
        }
    }

    /// 单个资源的费用估算
    pub fn estimate_resource_cost(
        &self,
        resource: &ComputeResource,
        workers: i32,
        total_workers: i32,
        analysis: &ExperimentAnalysis,
    ) -> f64 {
        if workers <= 0 {
            return 0.0;
        }
        let model = &self.cost_model;
        let hours = model.assumed_walltime_hours;
        let base_rate = if resource.cost_per_hour > 0.0 {
            resource.cost_per_hour
        } else {
            model.base_worker_cost_per_hour
        };

        let per_worker = base_rate * hours
            + model.cpu_cost_per_core_hour * analysis.cpu_cores_per_task as f64 * hours
            + model.memory_cost_per_gb_hour * (analysis.memory_mb_per_task as f64 / 1024.0) * hours
            + model.gpu_cost_per_hour * analysis.gpus_per_task as f64 * hours;

        let remote_gb = analysis
            .remote_input_bytes
            .get(&resource.id)
            .copied()
            .unwrap_or(0) as f64
            / BYTES_PER_GB;
        let share = workers as f64 / total_workers.max(1) as f64;
        let transfer = model.data_transfer_cost_per_gb * remote_gb * share;

        (per_worker * workers as f64 + transfer) * resource_type_multiplier(resource.resource_type)
    }
}

/// 按评分分配Worker，保证总数小于任务数；单任务只分配一个Worker
fn allocate_workers(scored: &[ScoredResource], total_tasks: usize) -> HashMap<String, i32> {
    let mut allocation = HashMap::new();
    if scored.is_empty() || total_tasks == 0 {
        return allocation;
    }

    if total_tasks == 1 {
        let mut best = &scored[0];
        for entry in &scored[1..] {
            if entry.score > best.score {
                best = entry;
            }
        }
        allocation.insert(best.resource.id.clone(), 1);
        return allocation;
    }

    let baseline = (total_tasks as f64 / TASKS_PER_WORKER).max(1.0);
    for entry in scored {
        let workers = ((entry.score * baseline).round() as i32)
            .max(1)
            .min(entry.resource.max_workers.max(1));
        allocation.insert(entry.resource.id.clone(), workers);
    }

    let limit = total_tasks as i32;
    let total: i32 = allocation.values().sum();
    if total >= limit {
        let factor = (limit - 1) as f64 / total as f64;
        for workers in allocation.values_mut() {
            *workers = ((*workers as f64 * factor).floor() as i32).max(1);
        }
    }

    // 下限为1可能仍然超出，继续削减：先减多分配的资源，再移除评分最低的资源
    let mut order: Vec<&ScoredResource> = scored.iter().collect();
    order.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    while allocation.values().sum::<i32>() >= limit {
        let largest = allocation
            .iter()
            .filter(|(_, w)| **w > 1)
            .max_by_key(|(_, w)| **w)
            .map(|(id, _)| id.clone());
        match largest {
            Some(id) => {
                if let Some(workers) = allocation.get_mut(&id) {
                    *workers -= 1;
                }
            }
            None => {
                let Some(weakest) = order
                    .iter()
                    .find(|e| allocation.contains_key(&e.resource.id))
                    .map(|e| e.resource.id.clone())
                else {
                    break;
                };
                allocation.remove(&weakest);
            }
        }
    }
    allocation
}
