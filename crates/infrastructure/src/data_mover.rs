//! 本地文件系统数据移动实现
//!
//! 将任务输入文件复制到 `<staging_root>/<计算资源ID>/` 下，按 (路径, 计算资源) 维护缓存，
//! 复制完成后用 SHA-256 校验文件完整性。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_domain::{
    CacheEntry, DataMover, FileMetadata, StagingOperation, StagingProgressReporter, Task,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type CacheKey = (String, String);

pub struct LocalDataMover {
    staging_root: PathBuf,
    cache: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
}

impl LocalDataMover {
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }

    /// 文件在计算资源上的暂存位置
    pub fn destination_for(&self, file_path: &str, compute_resource_id: &str) -> PathBuf {
        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.replace('/', "_"));
        self.staging_root.join(compute_resource_id).join(file_name)
    }
}

/// 计算文件的 SHA-256 十六进制摘要
pub async fn sha256_file(path: impl AsRef<Path>) -> SchedulerResult<String> {
    let bytes = tokio::fs::read(path.as_ref()).await.map_err(|e| {
        SchedulerError::DataMovement(format!("读取文件 {} 失败: {e}", path.as_ref().display()))
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

async fn lookup_cache(
    cache: &RwLock<HashMap<CacheKey, CacheEntry>>,
    file_path: &str,
    checksum: &str,
    compute_resource_id: &str,
) -> Option<CacheEntry> {
    let key = (file_path.to_string(), compute_resource_id.to_string());
    let mut cache = cache.write().await;
    match cache.get_mut(&key) {
        Some(entry) if entry.checksum == checksum => {
            entry.last_accessed = Utc::now();
            Some(entry.clone())
        }
        Some(_) => {
            debug!("缓存条目校验和不一致，移除: {} @ {}", file_path, compute_resource_id);
            cache.remove(&key);
            None
        }
        None => None,
    }
}

/// 复制单个文件并校验，返回实际写入的字节数
async fn copy_and_verify(file: &FileMetadata, destination: &Path) -> SchedulerResult<i64> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            SchedulerError::DataMovement(format!("创建目录 {} 失败: {e}", parent.display()))
        })?;
    }
    let copied = tokio::fs::copy(&file.path, destination).await.map_err(|e| {
        SchedulerError::DataMovement(format!("复制文件 {} 失败: {e}", file.path))
    })?;

    if !file.checksum.is_empty() {
        let actual = sha256_file(destination).await?;
        if !actual.eq_ignore_ascii_case(&file.checksum) {
            let _ = tokio::fs::remove_file(destination).await;
            return Err(SchedulerError::DataMovement(format!(
                "文件 {} 校验失败: 期望 {}, 实际 {}",
                file.path, file.checksum, actual
            )));
        }
    }
    Ok(copied as i64)
}

#[async_trait]
impl DataMover for LocalDataMover {
    async fn begin_proactive_staging(
        &self,
        task: &Task,
        operation: &StagingOperation,
        reporter: Arc<dyn StagingProgressReporter>,
    ) -> SchedulerResult<()> {
        let files = task.input_files.clone();
        let operation_id = operation.id.clone();
        let compute_resource_id = operation.compute_resource_id.clone();
        let destinations: Vec<PathBuf> = files
            .iter()
            .map(|f| self.destination_for(&f.path, &compute_resource_id))
            .collect();
        let cache = Arc::clone(&self.cache);

        info!(
            "开始为任务 {} 暂存 {} 个输入文件到 {}",
            task.id,
            files.len(),
            compute_resource_id
        );

        tokio::spawn(async move {
            let started = Instant::now();
            let mut transferred: i64 = 0;

            for (file, destination) in files.iter().zip(destinations.iter()) {
                let cached =
                    lookup_cache(&cache, &file.path, &file.checksum, &compute_resource_id).await;
                if cached.is_some() {
                    debug!("缓存命中: {} @ {}", file.path, compute_resource_id);
                    transferred += file.size;
                } else {
                    match copy_and_verify(file, destination).await {
                        Ok(bytes) => {
                            transferred += bytes;
                            let entry = CacheEntry::for_file(file, compute_resource_id.clone());
                            cache.write().await.insert(
                                (file.path.clone(), compute_resource_id.clone()),
                                entry,
                            );
                        }
                        Err(e) => {
                            warn!("暂存操作 {} 传输失败: {}", operation_id, e);
                            if let Err(report_err) =
                                reporter.report_failure(&operation_id, &e.to_string()).await
                            {
                                warn!("回报暂存失败出错: {}", report_err);
                            }
                            return;
                        }
                    }
                }

                let elapsed = started.elapsed().as_secs_f64();
                let rate = (elapsed > 0.0).then(|| transferred as f64 / elapsed);
                if let Err(e) = reporter
                    .report_progress(&operation_id, transferred, rate)
                    .await
                {
                    // 操作可能已被超时清理
                    warn!("回报暂存进度失败 {}: {}", operation_id, e);
                    return;
                }
            }

            if let Err(e) = reporter.report_complete(&operation_id, transferred).await {
                warn!("回报暂存完成失败 {}: {}", operation_id, e);
                return;
            }
            debug!("暂存操作 {} 传输结束，共 {} 字节", operation_id, transferred);
        });

        Ok(())
    }

    async fn check_cache(
        &self,
        file_path: &str,
        checksum: &str,
        compute_resource_id: &str,
    ) -> SchedulerResult<Option<CacheEntry>> {
        Ok(lookup_cache(&self.cache, file_path, checksum, compute_resource_id).await)
    }

    async fn record_cache_entry(&self, entry: CacheEntry) -> SchedulerResult<()> {
        let key = (entry.file_path.clone(), entry.compute_resource_id.clone());
        self.cache.write().await.insert(key, entry);
        Ok(())
    }

    async fn verify_data_integrity(
        &self,
        file_path: &str,
        expected_checksum: &str,
    ) -> SchedulerResult<bool> {
        let actual = sha256_file(file_path).await?;
        Ok(actual.eq_ignore_ascii_case(expected_checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        progress: Mutex<Vec<i64>>,
        completions: Mutex<Vec<i64>>,
        failures: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StagingProgressReporter for RecordingReporter {
        async fn report_progress(
            &self,
            _operation_id: &str,
            transferred_size: i64,
            _transfer_rate: Option<f64>,
        ) -> SchedulerResult<()> {
            self.progress.lock().await.push(transferred_size);
            Ok(())
        }

        async fn report_complete(
            &self,
            _operation_id: &str,
            transferred_size: i64,
        ) -> SchedulerResult<()> {
            self.completions.lock().await.push(transferred_size);
            Ok(())
        }

        async fn report_failure(&self, _operation_id: &str, error: &str) -> SchedulerResult<()> {
            self.failures.lock().await.push(error.to_string());
            Ok(())
        }
    }

    async fn wait_until<F>(mut check: F)
    where
        F: FnMut() -> futures::future::BoxFuture<'static, bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待条件超时");
    }

    #[tokio::test]
    async fn test_staging_copies_and_caches_files() {
        let source_dir = tempfile::tempdir().unwrap();
        let staging_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("input.dat");
        tokio::fs::write(&source, b"hello staging").await.unwrap();
        let checksum = sha256_file(&source).await.unwrap();

        let mover = LocalDataMover::new(staging_dir.path());
        let mut task = Task::new("exp-1", "run");
        task.input_files = vec![FileMetadata::new(
            source.to_string_lossy(),
            13,
            checksum.to_uppercase(),
        )];
        let op = StagingOperation::new(&task.id, "w-1", "r-1");
        let reporter = Arc::new(RecordingReporter::default());

        mover
            .begin_proactive_staging(&task, &op, reporter.clone())
            .await
            .unwrap();

        let r = reporter.clone();
        wait_until(move || {
            let r = r.clone();
            Box::pin(async move { !r.completions.lock().await.is_empty() })
        })
        .await;

        assert_eq!(*reporter.progress.lock().await, vec![13]);
        assert_eq!(*reporter.completions.lock().await, vec![13]);
        assert!(reporter.failures.lock().await.is_empty());
        let staged = staging_dir.path().join("r-1").join("input.dat");
        assert!(staged.exists());
        assert!(mover
            .check_cache(&source.to_string_lossy(), &checksum.to_uppercase(), "r-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_source_reports_failure() {
        let staging_dir = tempfile::tempdir().unwrap();
        let mover = LocalDataMover::new(staging_dir.path());
        let mut task = Task::new("exp-1", "run");
        task.input_files = vec![FileMetadata::new("/definitely/missing/file.h5", 10, "")];
        let op = StagingOperation::new(&task.id, "w-1", "r-1");
        let reporter = Arc::new(RecordingReporter::default());

        mover
            .begin_proactive_staging(&task, &op, reporter.clone())
            .await
            .unwrap();

        let r = reporter.clone();
        wait_until(move || {
            let r = r.clone();
            Box::pin(async move { !r.failures.lock().await.is_empty() })
        })
        .await;
        assert!(reporter.progress.lock().await.is_empty());
        assert!(reporter.completions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_sizes_count_copied_bytes() {
        let source_dir = tempfile::tempdir().unwrap();
        let staging_dir = tempfile::tempdir().unwrap();
        let first = source_dir.path().join("a.dat");
        let second = source_dir.path().join("b.dat");
        tokio::fs::write(&first, b"0123456789").await.unwrap();
        tokio::fs::write(&second, b"abcde").await.unwrap();

        let mover = LocalDataMover::new(staging_dir.path());
        let mut task = Task::new("exp-1", "run");
        task.input_files = vec![
            FileMetadata::new(first.to_string_lossy(), 0, ""),
            FileMetadata::new(second.to_string_lossy(), 0, ""),
        ];
        let op = StagingOperation::new(&task.id, "w-1", "r-1");
        let reporter = Arc::new(RecordingReporter::default());

        mover
            .begin_proactive_staging(&task, &op, reporter.clone())
            .await
            .unwrap();

        let r = reporter.clone();
        wait_until(move || {
            let r = r.clone();
            Box::pin(async move { !r.completions.lock().await.is_empty() })
        })
        .await;

        assert_eq!(*reporter.progress.lock().await, vec![10, 15]);
        assert_eq!(*reporter.completions.lock().await, vec![15]);
        assert!(staging_dir.path().join("r-1").join("b.dat").exists());
    }

    #[tokio::test]
    async fn test_no_inputs_completes_immediately() {
        let staging_dir = tempfile::tempdir().unwrap();
        let mover = LocalDataMover::new(staging_dir.path());
        let task = Task::new("exp-1", "run");
        let op = StagingOperation::new(&task.id, "w-1", "r-1");
        let reporter = Arc::new(RecordingReporter::default());

        mover
            .begin_proactive_staging(&task, &op, reporter.clone())
            .await
            .unwrap();

        let r = reporter.clone();
        wait_until(move || {
            let r = r.clone();
            Box::pin(async move { !r.completions.lock().await.is_empty() })
        })
        .await;
        assert_eq!(*reporter.completions.lock().await, vec![0]);
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_checksum_change() {
        let mover = LocalDataMover::new("/tmp/unused");
        let file = FileMetadata::new("/nfs/a.h5", 100, "abc");
        mover
            .record_cache_entry(CacheEntry::for_file(&file, "r-1"))
            .await
            .unwrap();

        assert!(mover.check_cache("/nfs/a.h5", "abc", "r-1").await.unwrap().is_some());
        assert!(mover.check_cache("/nfs/a.h5", "abc", "r-2").await.unwrap().is_none());
        assert!(mover.check_cache("/nfs/a.h5", "def", "r-1").await.unwrap().is_none());
        assert_eq!(mover.cache_size().await, 0);
    }

    #[tokio::test]
    async fn test_verify_data_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let mover = LocalDataMover::new(dir.path());
        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

        assert!(mover
            .verify_data_integrity(&path.to_string_lossy(), expected)
            .await
            .unwrap());
        assert!(!mover
            .verify_data_integrity(&path.to_string_lossy(), "00")
            .await
            .unwrap());
        assert!(mover
            .verify_data_integrity("/no/such/file", expected)
            .await
            .is_err());
    }
}
