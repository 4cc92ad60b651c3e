use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 订阅 task.queued 事件立即分配计算资源
    pub event_driven_assignment: bool,
    pub default_max_retries: i32,
    pub worker_walltime_seconds: i64,
    pub job_heartbeat_interval_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_driven_assignment: true,
            default_max_retries: 3,
            worker_walltime_seconds: 1800, // 30分钟
            job_heartbeat_interval_seconds: 30,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能为负数"));
        }
        if self.worker_walltime_seconds <= 0 {
            return Err(anyhow::anyhow!("Worker墙钟时间必须大于0"));
        }
        if self.job_heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("后台任务心跳间隔必须大于0"));
        }
        Ok(())
    }
}

/// Worker池成本模型的单价
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// 计算资源未配置 cost_per_hour 时使用
    pub base_worker_cost_per_hour: f64,
    pub cpu_cost_per_core_hour: f64,
    pub memory_cost_per_gb_hour: f64,
    pub gpu_cost_per_hour: f64,
    pub data_transfer_cost_per_gb: f64,
    pub assumed_walltime_hours: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            base_worker_cost_per_hour: 0.10,
            cpu_cost_per_core_hour: 0.05,
            memory_cost_per_gb_hour: 0.01,
            gpu_cost_per_hour: 0.50,
            data_transfer_cost_per_gb: 0.02,
            assumed_walltime_hours: 0.5,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let rates = [
            self.base_worker_cost_per_hour,
            self.cpu_cost_per_core_hour,
            self.memory_cost_per_gb_hour,
            self.gpu_cost_per_hour,
            self.data_transfer_cost_per_gb,
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(anyhow::anyhow!("成本单价必须为非负数"));
        }
        if !self.assumed_walltime_hours.is_finite() || self.assumed_walltime_hours <= 0.0 {
            return Err(anyhow::anyhow!("假定墙钟时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerDetectorConfig {
    pub enabled: bool,
    pub detection_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
}

impl Default for WorkerDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detection_interval_seconds: 30, // 30秒检测间隔
            heartbeat_timeout_seconds: 90,  // 90秒心跳超时
        }
    }
}

impl WorkerDetectorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.detection_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Worker检测间隔必须大于0"));
        }
        if self.heartbeat_timeout_seconds <= self.detection_interval_seconds {
            return Err(anyhow::anyhow!("心跳超时时间必须大于检测间隔"));
        }
        Ok(())
    }
}
