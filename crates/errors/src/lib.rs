use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("实验未找到: {id}")]
    ExperimentNotFound { id: String },
    #[error("计算资源未找到: {id}")]
    ComputeResourceNotFound { id: String },
    #[error("数据暂存操作未找到: {id}")]
    StagingOperationNotFound { id: String },
    #[error("非法的{entity}状态转换: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("状态不匹配: {entity} {id} 期望状态 {expected}, 实际状态 {actual}")]
    StateMismatch {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },
    #[error("状态无效: {0}")]
    InvalidState(String),
    #[error("任务 {task_id} 未分配给Worker {worker_id}")]
    TaskNotAssigned { task_id: String, worker_id: String },
    #[error("任务 {task_id} 已被其他Worker认领")]
    AlreadyAssigned { task_id: String },
    #[error("Worker不可用: {id}")]
    WorkerUnavailable { id: String },
    #[error("没有可用的计算资源: {0}")]
    NoAvailableResources(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("事件发布错误: {0}")]
    EventPublish(String),
    #[error("数据传输错误: {0}")]
    DataMovement(String),
    #[error("Worker通信错误: {0}")]
    WorkerTransport(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("内部错误: {0}")]
    Internal(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn experiment_not_found<S: Into<String>>(id: S) -> Self {
        Self::ExperimentNotFound { id: id.into() }
    }
    pub fn compute_resource_not_found<S: Into<String>>(id: S) -> Self {
        Self::ComputeResourceNotFound { id: id.into() }
    }
    pub fn staging_operation_not_found<S: Into<String>>(id: S) -> Self {
        Self::StagingOperationNotFound { id: id.into() }
    }
    pub fn invalid_transition<F: ToString, T: ToString>(entity: &'static str, from: F, to: T) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
    pub fn state_mismatch<E: ToString, A: ToString>(
        entity: &'static str,
        id: &str,
        expected: E,
        actual: A,
    ) -> Self {
        Self::StateMismatch {
            entity,
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// 实体不存在类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::TaskNotFound { .. }
                | SchedulerError::WorkerNotFound { .. }
                | SchedulerError::ExperimentNotFound { .. }
                | SchedulerError::ComputeResourceNotFound { .. }
                | SchedulerError::StagingOperationNotFound { .. }
        )
    }

    /// 操作与当前状态不兼容（包括乐观并发冲突）
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidTransition { .. }
                | SchedulerError::StateMismatch { .. }
                | SchedulerError::InvalidState(_)
                | SchedulerError::TaskNotAssigned { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_) | SchedulerError::Configuration(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::DatabaseOperation(_)
                | SchedulerError::Network(_)
                | SchedulerError::Timeout(_)
                | SchedulerError::StateMismatch { .. }
                | SchedulerError::AlreadyAssigned { .. }
        )
    }
    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::TaskNotFound { .. } => "请求的任务不存在",
            SchedulerError::WorkerNotFound { .. } => "请求的Worker节点不存在",
            SchedulerError::ExperimentNotFound { .. } => "请求的实验不存在",
            SchedulerError::ComputeResourceNotFound { .. } => "请求的计算资源不存在",
            SchedulerError::InvalidTransition { .. } | SchedulerError::InvalidState(_) => {
                "当前状态不允许该操作"
            }
            SchedulerError::StateMismatch { .. } | SchedulerError::AlreadyAssigned { .. } => {
                "数据已被并发修改，请稍后重试"
            }
            SchedulerError::WorkerUnavailable { .. } => "Worker当前不可用",
            SchedulerError::NoAvailableResources(_) => "没有可用的计算资源，请稍后重试",
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
