//! 领域事件
//!
//! 事件信封 `{id, type, source, timestamp, data}`，其中 `data` 为按事件类型区分的强类型负载。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use scheduler_errors::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{ExperimentStatus, Metadata, TaskStatus, WorkerStatus};

pub mod event_types {
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_STATE_CHANGED: &str = "task.state.changed";
    pub const WORKER_STATE_CHANGED: &str = "worker.state.changed";
    pub const WORKER_HEARTBEAT: &str = "worker.heartbeat";
    pub const WORKER_FAILED: &str = "worker.failed";
    pub const EXPERIMENT_STATE_CHANGED: &str = "experiment.state.changed";
    pub const EXPERIMENT_COMPLETED: &str = "experiment.completed";
    pub const EXPERIMENT_FAILED: &str = "experiment.failed";
    pub const SCHEDULING_PLAN_CREATED: &str = "scheduling.plan.created";
    pub const STAGING_CREATED: &str = "staging.operation.created";
    pub const STAGING_STARTED: &str = "staging.operation.started";
    pub const STAGING_COMPLETED: &str = "staging.operation.completed";
    pub const STAGING_FAILED: &str = "staging.operation.failed";
    pub const STAGING_RESUMED: &str = "staging.operation.resumed";
}

/// 按事件类型区分的负载
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEventPayload {
    TaskQueued {
        task_id: String,
        experiment_id: String,
    },
    TaskAssigned {
        task_id: String,
        experiment_id: String,
        compute_resource_id: Option<String>,
        worker_id: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        worker_id: String,
        duration_ms: Option<i64>,
    },
    TaskFailed {
        task_id: String,
        worker_id: String,
        error: String,
        retry_count: i32,
        will_retry: bool,
    },
    TaskStateChanged {
        task_id: String,
        from_status: TaskStatus,
        to_status: TaskStatus,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
    },
    WorkerStateChanged {
        worker_id: String,
        from_status: WorkerStatus,
        to_status: WorkerStatus,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
    },
    WorkerHeartbeat {
        worker_id: String,
        cpu_usage_percent: f64,
        memory_usage_percent: f64,
    },
    WorkerFailed {
        worker_id: String,
        requeued_task_id: Option<String>,
    },
    ExperimentStateChanged {
        experiment_id: String,
        from_status: ExperimentStatus,
        to_status: ExperimentStatus,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
    },
    ExperimentCompleted {
        experiment_id: String,
        total_tasks: usize,
    },
    ExperimentFailed {
        experiment_id: String,
        total_tasks: usize,
        failed_tasks: usize,
    },
    SchedulingPlanCreated {
        experiment_id: String,
        worker_distribution: HashMap<String, i32>,
        assigned_tasks: usize,
        estimated_cost: f64,
    },
    StagingOperationCreated {
        operation_id: String,
        task_id: String,
    },
    StagingOperationStarted {
        operation_id: String,
        task_id: String,
    },
    StagingOperationCompleted {
        operation_id: String,
        task_id: String,
    },
    StagingOperationFailed {
        operation_id: String,
        task_id: String,
        error: String,
    },
    StagingOperationResumed {
        operation_id: String,
        task_id: String,
    },
}

impl DomainEventPayload {
    pub fn event_type(&self) -> &'static str {
        use event_types::*;
        match self {
            Self::TaskQueued { .. } => TASK_QUEUED,
            Self::TaskAssigned { .. } => TASK_ASSIGNED,
            Self::TaskCompleted { .. } => TASK_COMPLETED,
            Self::TaskFailed { .. } => TASK_FAILED,
            Self::TaskStateChanged { .. } => TASK_STATE_CHANGED,
            Self::WorkerStateChanged { .. } => WORKER_STATE_CHANGED,
            Self::WorkerHeartbeat { .. } => WORKER_HEARTBEAT,
            Self::WorkerFailed { .. } => WORKER_FAILED,
            Self::ExperimentStateChanged { .. } => EXPERIMENT_STATE_CHANGED,
            Self::ExperimentCompleted { .. } => EXPERIMENT_COMPLETED,
            Self::ExperimentFailed { .. } => EXPERIMENT_FAILED,
            Self::SchedulingPlanCreated { .. } => SCHEDULING_PLAN_CREATED,
            Self::StagingOperationCreated { .. } => STAGING_CREATED,
            Self::StagingOperationStarted { .. } => STAGING_STARTED,
            Self::StagingOperationCompleted { .. } => STAGING_COMPLETED,
            Self::StagingOperationFailed { .. } => STAGING_FAILED,
            Self::StagingOperationResumed { .. } => STAGING_RESUMED,
        }
    }

    /// 事件所属聚合的ID
    pub fn aggregate_id(&self) -> &str {
        match self {
            Self::TaskQueued { task_id, .. }
            | Self::TaskAssigned { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskStateChanged { task_id, .. } => task_id,
            Self::WorkerStateChanged { worker_id, .. }
            | Self::WorkerHeartbeat { worker_id, .. }
            | Self::WorkerFailed { worker_id, .. } => worker_id,
            Self::ExperimentStateChanged { experiment_id, .. }
            | Self::ExperimentCompleted { experiment_id, .. }
            | Self::ExperimentFailed { experiment_id, .. }
            | Self::SchedulingPlanCreated { experiment_id, .. } => experiment_id,
            Self::StagingOperationCreated { operation_id, .. }
            | Self::StagingOperationStarted { operation_id, .. }
            | Self::StagingOperationCompleted { operation_id, .. }
            | Self::StagingOperationFailed { operation_id, .. }
            | Self::StagingOperationResumed { operation_id, .. } => operation_id,
        }
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.aggregate_id().trim().is_empty() {
            return Err(SchedulerError::validation_error(format!(
                "事件 {} 缺少聚合ID",
                self.event_type()
            )));
        }
        match self {
            Self::TaskAssigned {
                compute_resource_id: None,
                worker_id: None,
                ..
            } => Err(SchedulerError::validation_error(
                "task.assigned 事件必须包含计算资源或Worker",
            )),
            Self::TaskFailed { error, .. } | Self::StagingOperationFailed { error, .. }
                if error.is_empty() =>
            {
                Err(SchedulerError::validation_error(format!(
                    "事件 {} 缺少错误信息",
                    self.event_type()
                )))
            }
            Self::WorkerHeartbeat {
                cpu_usage_percent,
                memory_usage_percent,
                ..
            } if !cpu_usage_percent.is_finite() || !memory_usage_percent.is_finite() => Err(
                SchedulerError::validation_error("心跳事件的资源使用率无效"),
            ),
            _ => Ok(()),
        }
    }
}

/// 事件信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: DomainEventPayload,
}

impl DomainEvent {
    pub fn new(source: impl Into<String>, data: DomainEventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: data.event_type().to_string(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn aggregate_id(&self) -> &str {
        self.data.aggregate_id()
    }

    /// 发布前校验：类型与负载一致且必填字段非空
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.source.trim().is_empty() {
            return Err(SchedulerError::validation_error("事件来源不能为空"));
        }
        if self.event_type != self.data.event_type() {
            return Err(SchedulerError::validation_error(format!(
                "事件类型 {} 与负载类型 {} 不一致",
                self.event_type,
                self.data.event_type()
            )));
        }
        self.data.validate()
    }
}
