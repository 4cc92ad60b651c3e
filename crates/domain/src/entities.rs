use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 实体上附带的任意元数据
pub type Metadata = HashMap<String, serde_json::Value>;

/// 任务默认最大重试次数
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// 预配Worker默认的墙钟时间（秒）
pub const DEFAULT_WORKER_WALLTIME_SECONDS: i64 = 30 * 60;
/// 暂存操作默认超时时间（秒）
pub const DEFAULT_STAGING_TIMEOUT_SECONDS: i64 = 600;

/// 为状态枚举生成字符串转换
macro_rules! status_strings {
    ($ty:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(format!("无效的{}: {s}", $label)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Queued,
    DataStaging,
    EnvSetup,
    Running,
    OutputStaging,
    Completed,
    Failed,
    Canceled,
}

status_strings!(TaskStatus, "任务状态", {
    Created => "CREATED",
    Queued => "QUEUED",
    DataStaging => "DATA_STAGING",
    EnvSetup => "ENV_SETUP",
    Running => "RUNNING",
    OutputStaging => "OUTPUT_STAGING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Canceled => "CANCELED",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// 任务已离开队列、正在某个计算资源上推进
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::DataStaging
                | TaskStatus::EnvSetup
                | TaskStatus::Running
                | TaskStatus::OutputStaging
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Terminated,
}

status_strings!(WorkerStatus, "Worker状态", {
    Idle => "IDLE",
    Busy => "BUSY",
    Terminated => "TERMINATED",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Created,
    Executing,
    Completed,
    Canceled,
}

status_strings!(ExperimentStatus, "实验状态", {
    Created => "CREATED",
    Executing => "EXECUTING",
    Completed => "COMPLETED",
    Canceled => "CANCELED",
});

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeResourceType {
    Slurm,
    Kubernetes,
    BareMetal,
}

status_strings!(ComputeResourceType, "计算资源类型", {
    Slurm => "SLURM",
    Kubernetes => "KUBERNETES",
    BareMetal => "BARE_METAL",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeResourceStatus {
    Active,
    Inactive,
}

status_strings!(ComputeResourceStatus, "计算资源状态", {
    Active => "ACTIVE",
    Inactive => "INACTIVE",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingOperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

status_strings!(StagingOperationStatus, "暂存操作状态", {
    Pending => "PENDING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Timeout => "TIMEOUT",
});

impl StagingOperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StagingOperationStatus::Completed
                | StagingOperationStatus::Failed
                | StagingOperationStatus::Timeout
        )
    }
}

/// 输入/输出文件描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: String,
    pub size: i64,
    pub checksum: String,
}

impl FileMetadata {
    pub fn new(path: impl Into<String>, size: i64, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            checksum: checksum.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub experiment_id: String,
    pub status: TaskStatus,
    pub command: String,
    pub execution_script: Option<String>,
    /// 仅在分配给某个Worker期间非空
    pub worker_id: Option<String>,
    pub compute_resource_id: Option<String>,
    pub input_files: Vec<FileMetadata>,
    pub output_files: Vec<FileMetadata>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error: Option<String>,
    pub result_summary: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Task {
    pub fn new(experiment_id: impl Into<String>, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            experiment_id: experiment_id.into(),
            status: TaskStatus::Created,
            command: command.into(),
            execution_script: None,
            worker_id: None,
            compute_resource_id: None,
            input_files: Vec::new(),
            output_files: Vec::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            result_summary: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_assigned_to(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }

    /// 元数据中的优先级标签（小写）
    pub fn priority(&self) -> Option<String> {
        self.metadata
            .get("priority")
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::milliseconds)
    }

    pub fn total_input_size(&self) -> i64 {
        self.input_files.iter().map(|f| f.size).sum()
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (实验: {}, 状态: {})",
            self.id, self.experiment_id, self.status
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub compute_resource_id: String,
    pub experiment_id: String,
    pub user_id: Option<String>,
    pub status: WorkerStatus,
    /// 当且仅当状态为BUSY时非空
    pub current_task_id: Option<String>,
    pub walltime_seconds: i64,
    pub walltime_remaining_seconds: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        compute_resource_id: impl Into<String>,
        experiment_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            compute_resource_id: compute_resource_id.into(),
            experiment_id: experiment_id.into(),
            user_id: None,
            status: WorkerStatus::Idle,
            current_task_id: None,
            walltime_seconds: DEFAULT_WORKER_WALLTIME_SECONDS,
            walltime_remaining_seconds: DEFAULT_WORKER_WALLTIME_SECONDS,
            last_heartbeat: now,
            registered_at: now,
            updated_at: now,
            terminated_at: None,
            metadata: Metadata::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle && self.current_task_id.is_none()
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }
}

/// 单个任务的参数组合
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterSet {
    pub values: BTreeMap<String, String>,
}

impl ParameterSet {
    pub fn new<K, V, I>(values: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// 将命令模板中的 `{name}` 占位符替换为参数值
    pub fn render(&self, template: &str) -> String {
        self.values.iter().fold(template.to_string(), |acc, (k, v)| {
            acc.replace(&format!("{{{k}}}"), v)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    pub cpu_cores: i32,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub gpus: i32,
    pub walltime_minutes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConstraints {
    pub max_cost: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preferred_resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub parameters: Vec<ParameterSet>,
    pub command_template: String,
    pub requirements: ResourceRequirements,
    pub constraints: ExperimentConstraints,
    pub owner_id: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        command_template: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: ExperimentStatus::Created,
            parameters: Vec::new(),
            command_template: command_template.into(),
            requirements: ResourceRequirements::default(),
            constraints: ExperimentConstraints::default(),
            owner_id: owner_id.into(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// 元数据或约束中指定的首选计算资源
    pub fn preferred_resource_id(&self) -> Option<&str> {
        self.metadata
            .get("preferred_resource_id")
            .and_then(|v| v.as_str())
            .or_else(|| self.constraints.preferred_resources.first().map(String::as_str))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResource {
    pub id: String,
    pub name: String,
    pub resource_type: ComputeResourceType,
    pub status: ComputeResourceStatus,
    pub max_workers: i32,
    pub current_workers: i32,
    pub cost_per_hour: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComputeResource {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        resource_type: ComputeResourceType,
        max_workers: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            resource_type,
            status: ComputeResourceStatus::Active,
            max_workers,
            current_workers: 0,
            cost_per_hour: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_accessible(&self) -> bool {
        self.status == ComputeResourceStatus::Active && self.max_workers > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingOperation {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub compute_resource_id: String,
    pub status: StagingOperationStatus,
    pub source_path: String,
    pub destination_path: String,
    pub total_size: Option<i64>,
    pub transferred_size: i64,
    pub transfer_rate: Option<f64>,
    pub error_message: Option<String>,
    pub timeout_seconds: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 数据移动方确认全部文件已传输的时间
    #[serde(default)]
    pub transfer_finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagingOperation {
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        compute_resource_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let task_id = task_id.into();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        Self {
            id: format!("staging_{task_id}_{nanos}"),
            task_id,
            worker_id: worker_id.into(),
            compute_resource_id: compute_resource_id.into(),
            status: StagingOperationStatus::Pending,
            source_path: String::new(),
            destination_path: String::new(),
            total_size: None,
            transferred_size: 0,
            transfer_rate: None,
            error_message: None,
            timeout_seconds: DEFAULT_STAGING_TIMEOUT_SECONDS,
            started_at: None,
            completed_at: None,
            transfer_finished_at: None,
            last_heartbeat: now,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// StartedAt + TimeoutSeconds 已过
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => now >= started + Duration::seconds(self.timeout_seconds),
            None => false,
        }
    }

    /// 只认数据移动方的完成确认，字节数与声明大小相符不算完成
    pub fn is_transfer_finished(&self) -> bool {
        self.transfer_finished_at.is_some()
    }

    pub fn progress_percent(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(100.0),
            Some(total) => Some((self.transferred_size as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Worker的性能与资源使用情况
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub average_task_duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

impl WorkerMetrics {
    pub fn sample(worker_id: impl Into<String>, cpu_usage_percent: f64, memory_usage_percent: f64) -> Self {
        Self {
            worker_id: worker_id.into(),
            cpu_usage_percent,
            memory_usage_percent,
            tasks_completed: 0,
            tasks_failed: 0,
            average_task_duration_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn has_history(&self) -> bool {
        self.tasks_completed + self.tasks_failed > 0
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        self.tasks_completed as f64 / total as f64
    }
}
