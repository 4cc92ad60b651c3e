use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_errors::SchedulerResult;
use serde::{Deserialize, Serialize};

use crate::entities::{FileMetadata, StagingOperation, Task};

/// 计算资源上的数据缓存条目，键为 (路径, 校验和, 计算资源)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub file_path: String,
    pub checksum: String,
    pub compute_resource_id: String,
    pub size_bytes: i64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    pub fn for_file(file: &FileMetadata, compute_resource_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            file_path: file.path.clone(),
            checksum: file.checksum.clone(),
            compute_resource_id: compute_resource_id.into(),
            size_bytes: file.size,
            cached_at: now,
            last_accessed: now,
        }
    }
}

/// 数据传输实现通过该接口回报暂存进度
#[async_trait]
pub trait StagingProgressReporter: Send + Sync {
    async fn report_progress(
        &self,
        operation_id: &str,
        transferred_size: i64,
        transfer_rate: Option<f64>,
    ) -> SchedulerResult<()>;

    /// 全部文件传输并校验完毕；操作只有收到该确认后才能完成
    async fn report_complete(&self, operation_id: &str, transferred_size: i64)
        -> SchedulerResult<()>;

    async fn report_failure(&self, operation_id: &str, error: &str) -> SchedulerResult<()>;
}

/// 数据移动服务
///
/// 调度器只关心暂存操作的生命周期，具体传输方式由实现决定。
#[async_trait]
pub trait DataMover: Send + Sync {
    /// 为任务的输入文件启动预取暂存；传输在后台进行，通过 `reporter` 回报进度
    async fn begin_proactive_staging(
        &self,
        task: &Task,
        operation: &StagingOperation,
        reporter: Arc<dyn StagingProgressReporter>,
    ) -> SchedulerResult<()>;

    /// 校验和不一致的条目视为失效并移除
    async fn check_cache(
        &self,
        file_path: &str,
        checksum: &str,
        compute_resource_id: &str,
    ) -> SchedulerResult<Option<CacheEntry>>;

    async fn record_cache_entry(&self, entry: CacheEntry) -> SchedulerResult<()>;

    async fn verify_data_integrity(
        &self,
        file_path: &str,
        expected_checksum: &str,
    ) -> SchedulerResult<bool>;
}
