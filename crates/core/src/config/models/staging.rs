use serde::{Deserialize, Serialize};

/// 数据暂存操作配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// 新建暂存操作的默认超时
    pub default_timeout_seconds: i64,
    pub monitor_interval_seconds: u64,
    /// 单次监控的绝对上限
    pub monitor_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// 终态操作保留天数
    pub retention_days: i64,
    /// 本地数据移动的暂存根目录
    pub staging_root: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 600,
            monitor_interval_seconds: 5,
            monitor_timeout_seconds: 600, // 10分钟
            sweep_interval_seconds: 30,
            retention_days: 7,
            staging_root: "data/staging".to_string(),
        }
    }
}

impl StagingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("暂存超时时间必须大于0"));
        }
        if self.monitor_interval_seconds == 0 {
            return Err(anyhow::anyhow!("暂存监控间隔必须大于0"));
        }
        if self.monitor_timeout_seconds < self.monitor_interval_seconds {
            return Err(anyhow::anyhow!("暂存监控超时不能小于监控间隔"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("超时扫描间隔必须大于0"));
        }
        if self.retention_days <= 0 {
            return Err(anyhow::anyhow!("暂存记录保留天数必须大于0"));
        }
        if self.staging_root.trim().is_empty() {
            return Err(anyhow::anyhow!("暂存根目录不能为空"));
        }
        Ok(())
    }
}
