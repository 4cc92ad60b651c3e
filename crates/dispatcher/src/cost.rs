//! 任务分配评分
//!
//! 空闲Worker拉取任务时，在候选任务中按加权评分挑选最合适的一个：
//! 数据本地性 30%、Worker历史表现 40%、资源利用率 20%、任务优先级 10%。

use chrono::{DateTime, Utc};
use scheduler_domain::locality::input_locality_fraction;
use scheduler_domain::{ComputeResource, Task, WorkerMetrics};

pub const LOCALITY_WEIGHT: f64 = 0.3;
pub const PERFORMANCE_WEIGHT: f64 = 0.4;
pub const UTILIZATION_WEIGHT: f64 = 0.2;
pub const PRIORITY_WEIGHT: f64 = 0.1;

const NEUTRAL_SCORE: f64 = 0.5;
const MAX_AGE_BOOST: f64 = 0.3;

/// 输入文件与资源同址的比例；没有输入文件时取中性分
pub fn data_locality_score(task: &Task, resource: &ComputeResource) -> f64 {
    input_locality_fraction(task, resource).unwrap_or(NEUTRAL_SCORE)
}

fn duration_bucket(average_task_duration_ms: i64) -> f64 {
    if average_task_duration_ms <= 0 {
        return NEUTRAL_SCORE;
    }
    let hours = average_task_duration_ms as f64 / 3_600_000.0;
    if hours <= 0.5 {
        1.0
    } else if hours <= 1.0 {
        0.8
    } else if hours <= 2.0 {
        0.6
    } else {
        0.3
    }
}

pub fn worker_performance_score(metrics: &WorkerMetrics) -> f64 {
    if !metrics.has_history() {
        return NEUTRAL_SCORE;
    }
    metrics.success_rate() * 0.7 + duration_bucket(metrics.average_task_duration_ms) * 0.3
}

/// 偏好负载较低的Worker
pub fn resource_utilization_score(metrics: &WorkerMetrics) -> f64 {
    let cpu = (1.0 - metrics.cpu_usage_percent / 100.0).clamp(0.0, 1.0);
    let memory = (1.0 - metrics.memory_usage_percent / 100.0).clamp(0.0, 1.0);
    (cpu + memory) / 2.0
}

/// 元数据优先级加上等待时长补偿（防止饥饿），上限为1
pub fn task_priority_score(task: &Task, now: DateTime<Utc>) -> f64 {
    let base = match task.priority().as_deref() {
        Some("high") | Some("urgent") => 1.0,
        Some("medium") | Some("normal") => 0.7,
        Some("low") => 0.3,
        _ => NEUTRAL_SCORE,
    };
    let age_hours = ((now - task.created_at).num_seconds().max(0)) as f64 / 3600.0;
    let boost = (age_hours / 24.0).min(MAX_AGE_BOOST);
    (base + boost).min(1.0)
}

pub fn task_cost_score(
    task: &Task,
    resource: &ComputeResource,
    metrics: &WorkerMetrics,
    now: DateTime<Utc>,
) -> f64 {
    data_locality_score(task, resource) * LOCALITY_WEIGHT
        + worker_performance_score(metrics) * PERFORMANCE_WEIGHT
        + resource_utilization_score(metrics) * UTILIZATION_WEIGHT
        + task_priority_score(task, now) * PRIORITY_WEIGHT
}

/// 评分最高者胜出，同分取先出现的任务
pub fn select_best_task_by_cost<'a>(
    tasks: &'a [Task],
    resource: &ComputeResource,
    metrics: &WorkerMetrics,
    now: DateTime<Utc>,
) -> Option<(&'a Task, f64)> {
    let mut best: Option<(&Task, f64)> = None;
    for task in tasks {
        let score = task_cost_score(task, resource, metrics, now);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((task, score)),
        }
    }
    best
}
