//! 数据暂存操作管理
//!
//! 暂存操作持久化在仓储中，调度器重启后可以恢复。生命周期：
//! PENDING -> RUNNING -> {COMPLETED | FAILED | TIMEOUT}。
//! 后台扫描会将超时的操作标记为失败，并清理过期的终态记录。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::StagingConfig;
use scheduler_domain::{
    DomainEvent, DomainEventPayload, EventPublisher, Repository, StagingOperation,
    StagingOperationFilter, StagingOperationRepository, StagingOperationStatus,
    StagingProgressReporter, Task,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::state_manager::EVENT_SOURCE;

pub const SWEEP_TIMEOUT_MESSAGE: &str = "Operation timed out";
pub const MONITOR_TIMEOUT_MESSAGE: &str = "Staging timeout";
pub const RESUME_TIMEOUT_MESSAGE: &str = "Operation timed out during scheduler restart";

const ACTIVE_STATUSES: &[StagingOperationStatus] =
    &[StagingOperationStatus::Pending, StagingOperationStatus::Running];
const TERMINAL_STATUSES: &[StagingOperationStatus] = &[
    StagingOperationStatus::Completed,
    StagingOperationStatus::Failed,
    StagingOperationStatus::Timeout,
];

/// 单次监控的结果
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    /// 传输完成且回调成功
    Completed,
    /// 操作失败（包括回调失败），附带错误信息
    Failed(String),
    /// 超过监控时限
    TimedOut,
    /// 调度器关闭，操作保持RUNNING等待恢复
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// 一次超时扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 数据库不可达，本轮跳过
    pub skipped: bool,
    pub timed_out: usize,
    pub deleted: u64,
}

pub struct StagingOperationManager {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    config: StagingConfig,
    shutdown_tx: watch::Sender<bool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StagingOperationManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<dyn EventPublisher>,
        config: StagingConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            repo,
            events,
            config,
            shutdown_tx,
            sweep_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// 为任务创建暂存操作（PENDING）
    pub async fn create(
        &self,
        task: &Task,
        worker_id: &str,
        compute_resource_id: &str,
    ) -> SchedulerResult<StagingOperation> {
        let mut op = StagingOperation::new(&task.id, worker_id, compute_resource_id);
        op.timeout_seconds = self.config.default_timeout_seconds;
        op.total_size = Some(task.total_input_size());
        if let Some(first) = task.input_files.first() {
            op.source_path = first.path.clone();
        }
        op.destination_path = format!("{}/{}", compute_resource_id, task.id);
        op.metadata.insert(
            "input_files".to_string(),
            serde_json::json!(task.input_files.len()),
        );

        self.repo.create_staging_operation(&op).await?;
        info!(
            "创建暂存操作 {} (任务: {}, Worker: {}, {} 字节)",
            op.id,
            task.id,
            worker_id,
            task.total_input_size()
        );
        self.publish(DomainEventPayload::StagingOperationCreated {
            operation_id: op.id.clone(),
            task_id: op.task_id.clone(),
        })
        .await;
        Ok(op)
    }

    pub async fn get(&self, operation_id: &str) -> SchedulerResult<StagingOperation> {
        self.repo
            .get_staging_operation(operation_id)
            .await?
            .ok_or_else(|| SchedulerError::staging_operation_not_found(operation_id))
    }

    pub async fn get_by_task(&self, task_id: &str) -> SchedulerResult<Option<StagingOperation>> {
        self.repo.get_staging_operation_by_task(task_id).await
    }

    pub async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>> {
        self.repo
            .list_staging_operations(&StagingOperationFilter::with_statuses(ACTIVE_STATUSES))
            .await
    }

    /// 已超过超时窗口的RUNNING操作
    pub async fn list_timed_out(&self) -> SchedulerResult<Vec<StagingOperation>> {
        let now = Utc::now();
        Ok(self
            .repo
            .list_staging_operations(&StagingOperationFilter::with_statuses(&[
                StagingOperationStatus::Running,
            ]))
            .await?
            .into_iter()
            .filter(|op| op.is_timed_out(now))
            .collect())
    }

    pub async fn delete(&self, operation_id: &str) -> SchedulerResult<bool> {
        self.repo.delete_staging_operation(operation_id).await
    }

    pub async fn stats(&self) -> SchedulerResult<StagingStats> {
        let ops = self
            .repo
            .list_staging_operations(&StagingOperationFilter::default())
            .await?;
        let mut stats = StagingStats {
            total: ops.len(),
            ..Default::default()
        };
        for op in &ops {
            match op.status {
                StagingOperationStatus::Pending => stats.pending += 1,
                StagingOperationStatus::Running => stats.running += 1,
                StagingOperationStatus::Completed => stats.completed += 1,
                StagingOperationStatus::Failed => stats.failed += 1,
                StagingOperationStatus::Timeout => stats.timed_out += 1,
            }
        }
        Ok(stats)
    }

    /// PENDING -> RUNNING，记录开始时间
    pub async fn start(&self, operation_id: &str) -> SchedulerResult<StagingOperation> {
        let mut op = self.get(operation_id).await?;
        if op.status != StagingOperationStatus::Pending {
            return Err(SchedulerError::state_mismatch(
                "暂存操作",
                operation_id,
                StagingOperationStatus::Pending,
                op.status,
            ));
        }

        let now = Utc::now();
        op.status = StagingOperationStatus::Running;
        op.started_at = Some(now);
        op.last_heartbeat = now;
        op.updated_at = now;
        self.save(&op, &[StagingOperationStatus::Pending]).await?;

        debug!("暂存操作 {} 开始传输", operation_id);
        self.publish(DomainEventPayload::StagingOperationStarted {
            operation_id: op.id.clone(),
            task_id: op.task_id.clone(),
        })
        .await;
        Ok(op)
    }

    pub async fn update_progress(
        &self,
        operation_id: &str,
        transferred_size: i64,
        transfer_rate: Option<f64>,
    ) -> SchedulerResult<StagingOperation> {
        let mut op = self.get(operation_id).await?;
        if op.status != StagingOperationStatus::Running {
            return Err(SchedulerError::state_mismatch(
                "暂存操作",
                operation_id,
                StagingOperationStatus::Running,
                op.status,
            ));
        }

        let now = Utc::now();
        op.transferred_size = transferred_size.max(0);
        if transfer_rate.is_some() {
            op.transfer_rate = transfer_rate;
        }
        op.last_heartbeat = now;
        op.updated_at = now;
        self.save(&op, &[StagingOperationStatus::Running]).await?;

        debug!(
            "暂存操作 {} 进度: {} 字节 ({:.1}%)",
            operation_id,
            op.transferred_size,
            op.progress_percent().unwrap_or(0.0)
        );
        Ok(op)
    }

    /// 数据移动方确认传输结束；操作保持RUNNING，由监控执行完成回调后再完成
    pub async fn mark_transfer_finished(
        &self,
        operation_id: &str,
        transferred_size: i64,
    ) -> SchedulerResult<StagingOperation> {
        let mut op = self.get(operation_id).await?;
        if op.status != StagingOperationStatus::Running {
            return Err(SchedulerError::state_mismatch(
                "暂存操作",
                operation_id,
                StagingOperationStatus::Running,
                op.status,
            ));
        }

        let now = Utc::now();
        op.transferred_size = transferred_size.max(op.transferred_size);
        op.transfer_finished_at = Some(now);
        op.last_heartbeat = now;
        op.updated_at = now;
        self.save(&op, &[StagingOperationStatus::Running]).await?;

        debug!(
            "暂存操作 {} 传输结束，共 {} 字节",
            operation_id, op.transferred_size
        );
        Ok(op)
    }

    pub async fn complete(&self, operation_id: &str) -> SchedulerResult<StagingOperation> {
        let mut op = self.get(operation_id).await?;
        if op.status != StagingOperationStatus::Running {
            return Err(SchedulerError::state_mismatch(
                "暂存操作",
                operation_id,
                StagingOperationStatus::Running,
                op.status,
            ));
        }

        let now = Utc::now();
        op.status = StagingOperationStatus::Completed;
        if let Some(total) = op.total_size {
            op.transferred_size = op.transferred_size.max(total);
        }
        op.completed_at = Some(now);
        op.last_heartbeat = now;
        op.updated_at = now;
        self.save(&op, &[StagingOperationStatus::Running]).await?;

        info!("暂存操作 {} 已完成 (任务: {})", operation_id, op.task_id);
        self.publish(DomainEventPayload::StagingOperationCompleted {
            operation_id: op.id.clone(),
            task_id: op.task_id.clone(),
        })
        .await;
        Ok(op)
    }

    /// 将未结束的操作标记为FAILED并保留错误信息
    pub async fn fail(&self, operation_id: &str, error: &str) -> SchedulerResult<StagingOperation> {
        let mut op = self.get(operation_id).await?;
        if op.status.is_terminal() {
            return Err(SchedulerError::InvalidState(format!(
                "暂存操作 {} 已处于终态 {}",
                operation_id, op.status
            )));
        }

        let now = Utc::now();
        op.status = StagingOperationStatus::Failed;
        op.error_message = Some(error.to_string());
        op.completed_at = Some(now);
        op.updated_at = now;
        self.save(&op, ACTIVE_STATUSES).await?;

        warn!("暂存操作 {} 失败: {}", operation_id, error);
        self.publish(DomainEventPayload::StagingOperationFailed {
            operation_id: op.id.clone(),
            task_id: op.task_id.clone(),
            error: error.to_string(),
        })
        .await;
        Ok(op)
    }

    /// 调度器重启后恢复单个操作
    pub async fn resume(&self, operation_id: &str) -> SchedulerResult<StagingOperation> {
        let mut op = self.get(operation_id).await?;
        match op.status {
            StagingOperationStatus::Completed => {
                debug!("暂存操作 {} 已完成，无需恢复", operation_id);
                return Ok(op);
            }
            StagingOperationStatus::Failed | StagingOperationStatus::Timeout => {
                return Err(SchedulerError::InvalidState(format!(
                    "暂存操作 {} 已失败，无法恢复",
                    operation_id
                )));
            }
            StagingOperationStatus::Pending => {
                op = self.start(operation_id).await?;
            }
            StagingOperationStatus::Running => {
                let now = Utc::now();
                if op.is_timed_out(now) {
                    return self.fail(operation_id, RESUME_TIMEOUT_MESSAGE).await;
                }
                op.last_heartbeat = now;
                op.updated_at = now;
                self.save(&op, &[StagingOperationStatus::Running]).await?;
            }
        }

        info!("已恢复暂存操作 {} (任务: {})", operation_id, op.task_id);
        self.publish(DomainEventPayload::StagingOperationResumed {
            operation_id: op.id.clone(),
            task_id: op.task_id.clone(),
        })
        .await;
        Ok(op)
    }

    /// 启动时恢复全部未完成的操作，返回恢复后仍在运行的操作
    pub async fn resume_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>> {
        let pending = self.list_incomplete().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        info!("发现 {} 个未完成的暂存操作，开始恢复", pending.len());

        let mut resumed = Vec::new();
        for op in pending {
            match self.resume(&op.id).await {
                Ok(op) if op.status == StagingOperationStatus::Running => resumed.push(op),
                Ok(op) => debug!("暂存操作 {} 恢复后状态为 {}", op.id, op.status),
                Err(e) => error!("恢复暂存操作 {} 失败: {}", op.id, e),
            }
        }
        Ok(resumed)
    }

    /// 驱动单个操作直到结束
    ///
    /// 传输全部完成后先执行 `on_complete`，回调成功才将操作标记为完成；回调失败时
    /// 操作以该错误失败。调度器关闭时立即返回，操作保持RUNNING以便重启后恢复。
    pub async fn monitor<F, Fut>(
        &self,
        operation_id: &str,
        on_complete: F,
    ) -> SchedulerResult<MonitorOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = SchedulerResult<()>> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let op = self.get(operation_id).await?;
        if op.status == StagingOperationStatus::Pending {
            self.start(operation_id).await?;
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.monitor_timeout_seconds);
        let mut ticker = interval(Duration::from_secs(self.config.monitor_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut on_complete = Some(on_complete);

        loop {
            if *shutdown_rx.borrow() {
                info!("调度器关闭，暂存操作 {} 的监控中止", operation_id);
                return Ok(MonitorOutcome::Interrupted);
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("调度器关闭，暂存操作 {} 的监控中止", operation_id);
                        return Ok(MonitorOutcome::Interrupted);
                    }
                    continue;
                }
            }

            let op = self.get(operation_id).await?;
            match op.status {
                StagingOperationStatus::Failed | StagingOperationStatus::Timeout => {
                    return Ok(MonitorOutcome::Failed(
                        op.error_message.unwrap_or_else(|| "暂存失败".to_string()),
                    ));
                }
                StagingOperationStatus::Completed => return Ok(MonitorOutcome::Completed),
                StagingOperationStatus::Running if op.is_transfer_finished() => {
                    let Some(callback) = on_complete.take() else {
                        return Ok(MonitorOutcome::Completed);
                    };
                    if let Err(e) = callback().await {
                        let message = format!("Completion callback failed: {e}");
                        error!("暂存操作 {} 完成回调失败: {}", operation_id, e);
                        self.fail(operation_id, &message).await?;
                        return Ok(MonitorOutcome::Failed(message));
                    }
                    self.complete(operation_id).await?;
                    return Ok(MonitorOutcome::Completed);
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                self.fail(operation_id, MONITOR_TIMEOUT_MESSAGE).await?;
                return Ok(MonitorOutcome::TimedOut);
            }
        }
    }

    /// 执行一轮扫描：失败超时操作并清理过期终态记录；数据库不可达时跳过本轮
    pub async fn sweep_once(&self) -> SchedulerResult<SweepReport> {
        if let Err(e) = self.repo.ping().await {
            warn!("数据库不可达，跳过本轮暂存超时扫描: {}", e);
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        }

        let mut report = SweepReport::default();
        for op in self.list_timed_out().await? {
            match self.fail(&op.id, SWEEP_TIMEOUT_MESSAGE).await {
                Ok(_) => report.timed_out += 1,
                // 监控或回报器可能刚刚结束该操作
                Err(e) => debug!("超时扫描跳过暂存操作 {}: {}", op.id, e),
            }
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        report.deleted = self
            .repo
            .delete_staging_operations_before(TERMINAL_STATUSES, cutoff)
            .await?;

        if report.timed_out > 0 || report.deleted > 0 {
            info!(
                "暂存扫描完成: {} 个操作超时, 清理 {} 条过期记录",
                report.timed_out, report.deleted
            );
        }
        Ok(report)
    }

    /// 启动后台超时扫描循环
    pub async fn start_sweep(self: &Arc<Self>) {
        let mut slot = self.sweep_handle.lock().await;
        if slot.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(self.config.sweep_interval_seconds);
        *slot = Some(tokio::spawn(async move {
            info!("暂存超时扫描已启动，间隔 {:?}", period);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.sweep_once().await {
                            error!("暂存超时扫描失败: {}", e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("暂存超时扫描已停止");
        }));
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// 通知扫描与监控停止，并等待扫描循环退出
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("暂存扫描循环异常退出: {}", e);
            }
        }
    }

    async fn save(
        &self,
        op: &StagingOperation,
        expected: &[StagingOperationStatus],
    ) -> SchedulerResult<()> {
        if self.repo.update_staging_operation(op, expected).await? {
            return Ok(());
        }
        let actual = self
            .repo
            .get_staging_operation(&op.id)
            .await?
            .map(|current| current.status.to_string())
            .unwrap_or_else(|| "已删除".to_string());
        Err(SchedulerError::state_mismatch(
            "暂存操作",
            &op.id,
            expected
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("|"),
            actual,
        ))
    }

    async fn publish(&self, payload: DomainEventPayload) {
        let event = DomainEvent::new(EVENT_SOURCE, payload);
        let event_type = event.event_type.clone();
        if let Err(e) = self.events.publish(event).await {
            warn!("发布事件 {} 失败: {}", event_type, e);
        }
    }
}

#[async_trait]
impl StagingProgressReporter for StagingOperationManager {
    async fn report_progress(
        &self,
        operation_id: &str,
        transferred_size: i64,
        transfer_rate: Option<f64>,
    ) -> SchedulerResult<()> {
        self.update_progress(operation_id, transferred_size, transfer_rate)
            .await
            .map(|_| ())
    }

    async fn report_complete(
        &self,
        operation_id: &str,
        transferred_size: i64,
    ) -> SchedulerResult<()> {
        self.mark_transfer_finished(operation_id, transferred_size)
            .await
            .map(|_| ())
    }

    async fn report_failure(&self, operation_id: &str, error: &str) -> SchedulerResult<()> {
        self.fail(operation_id, error).await.map(|_| ())
    }
}
