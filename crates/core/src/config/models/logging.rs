use serde::{Deserialize, Serialize};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["json", "pretty", "compact"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !LOG_LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.level));
        }
        if !LOG_FORMATS.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.format));
        }
        Ok(())
    }
}
