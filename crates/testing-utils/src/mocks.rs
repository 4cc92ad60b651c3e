//! 记录调用的测试替身
//!
//! 仓储直接使用基础设施层的内存实现，这里只提供外部协作者的替身；故障注入见 `flaky`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scheduler_domain::{
    CacheEntry, DataMover, DomainEvent, EventPublisher, StagingOperation,
    StagingProgressReporter, Task, WorkerTransport,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 记录所有已发布事件
#[derive(Default, Clone)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<DomainEvent>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的发布全部失败
    pub fn fail_publishes(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> SchedulerResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(SchedulerError::EventPublish("mock publish failure".to_string()));
        }
        event.validate()?;
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownCall {
    pub worker_id: String,
    pub reason: String,
    pub graceful: bool,
}

#[derive(Default, Clone)]
pub struct RecordingWorkerTransport {
    calls: Arc<Mutex<Vec<ShutdownCall>>>,
}

impl RecordingWorkerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ShutdownCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerTransport for RecordingWorkerTransport {
    async fn shutdown_worker(
        &self,
        worker_id: &str,
        reason: &str,
        graceful: bool,
    ) -> SchedulerResult<()> {
        self.calls.lock().unwrap().push(ShutdownCall {
            worker_id: worker_id.to_string(),
            reason: reason.to_string(),
            graceful,
        });
        Ok(())
    }
}

/// 数据移动替身的行为
#[derive(Debug, Clone, PartialEq)]
pub enum StagingBehavior {
    /// 只记录，进度由测试通过保存的回报器驱动
    Manual,
    /// 立即回报全部输入已传输并确认完成
    CompleteImmediately,
    /// 立即回报失败
    FailImmediately(String),
    /// 启动即返回错误
    RejectStart(String),
    /// 先同步回报失败，再返回同样的错误
    ReportThenReject(String),
}

#[derive(Clone)]
pub struct MockDataMover {
    behavior: Arc<Mutex<StagingBehavior>>,
    started: Arc<Mutex<Vec<String>>>,
    reporters: Arc<Mutex<HashMap<String, Arc<dyn StagingProgressReporter>>>>,
    cache: Arc<Mutex<HashMap<(String, String), CacheEntry>>>,
}

impl MockDataMover {
    pub fn new(behavior: StagingBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            started: Arc::new(Mutex::new(Vec::new())),
            reporters: Arc::new(Mutex::new(HashMap::new())),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_behavior(&self, behavior: StagingBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// 已启动暂存的操作ID
    pub fn started_operations(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn reporter_for(&self, operation_id: &str) -> Option<Arc<dyn StagingProgressReporter>> {
        self.reporters.lock().unwrap().get(operation_id).cloned()
    }
}

impl Default for MockDataMover {
    fn default() -> Self {
        Self::new(StagingBehavior::Manual)
    }
}

#[async_trait]
impl DataMover for MockDataMover {
    async fn begin_proactive_staging(
        &self,
        task: &Task,
        operation: &StagingOperation,
        reporter: Arc<dyn StagingProgressReporter>,
    ) -> SchedulerResult<()> {
        let behavior = self.behavior.lock().unwrap().clone();
        if let StagingBehavior::RejectStart(msg) = &behavior {
            return Err(SchedulerError::DataMovement(msg.clone()));
        }

        if let StagingBehavior::ReportThenReject(msg) = &behavior {
            reporter.report_failure(&operation.id, msg).await?;
            return Err(SchedulerError::DataMovement(msg.clone()));
        }

        self.started.lock().unwrap().push(operation.id.clone());
        self.reporters
            .lock()
            .unwrap()
            .insert(operation.id.clone(), Arc::clone(&reporter));

        let operation_id = operation.id.clone();
        let total = task.total_input_size();
        match behavior {
            StagingBehavior::CompleteImmediately => {
                tokio::spawn(async move {
                    if reporter.report_progress(&operation_id, total, None).await.is_ok() {
                        let _ = reporter.report_complete(&operation_id, total).await;
                    }
                });
            }
            StagingBehavior::FailImmediately(msg) => {
                tokio::spawn(async move {
                    let _ = reporter.report_failure(&operation_id, &msg).await;
                });
            }
            StagingBehavior::Manual
            | StagingBehavior::RejectStart(_)
            | StagingBehavior::ReportThenReject(_) => {}
        }
        Ok(())
    }

    async fn check_cache(
        &self,
        file_path: &str,
        checksum: &str,
        compute_resource_id: &str,
    ) -> SchedulerResult<Option<CacheEntry>> {
        let key = (file_path.to_string(), compute_resource_id.to_string());
        Ok(self
            .cache
            .lock()
            .unwrap()
            .get(&key)
            .filter(|e| e.checksum == checksum)
            .cloned())
    }

    async fn record_cache_entry(&self, entry: CacheEntry) -> SchedulerResult<()> {
        let key = (entry.file_path.clone(), entry.compute_resource_id.clone());
        self.cache.lock().unwrap().insert(key, entry);
        Ok(())
    }

    async fn verify_data_integrity(
        &self,
        _file_path: &str,
        _expected_checksum: &str,
    ) -> SchedulerResult<bool> {
        Ok(true)
    }
}
