use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::WorkerDetectorConfig;
use scheduler_domain::{Repository, Worker, WorkerFilter, WorkerRepository, WorkerStatus};
use scheduler_errors::SchedulerResult;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// 失效Worker的处理方（通常是调度服务）
#[async_trait]
pub trait WorkerFailureHandler: Send + Sync {
    async fn handle_worker_failure(&self, worker_id: &str) -> SchedulerResult<()>;
}

/// Worker失效检测
///
/// 周期性扫描IDLE/BUSY的Worker，心跳超过阈值即交给 [`WorkerFailureHandler`] 处理。
/// 同一次失联只报告一次：Worker恢复心跳后再次超时才会重新报告。
pub struct WorkerFailureDetector {
    repo: Arc<dyn Repository>,
    handler: Arc<dyn WorkerFailureHandler>,
    config: WorkerDetectorConfig,
    /// 已报告的Worker及报告时的最后心跳
    reported: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerFailureDetector {
    pub fn new(
        repo: Arc<dyn Repository>,
        handler: Arc<dyn WorkerFailureHandler>,
        config: WorkerDetectorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            repo,
            handler,
            config,
            reported: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    fn is_worker_failed(&self, worker: &Worker, now: DateTime<Utc>) -> bool {
        if worker.status == WorkerStatus::Terminated {
            return false;
        }
        worker.heartbeat_age(now).num_seconds() > self.config.heartbeat_timeout_seconds as i64
    }

    /// 找出本轮新失联的Worker
    pub async fn detect_failed_workers(&self) -> SchedulerResult<Vec<Worker>> {
        debug!("开始检测失效的Worker");

        let now = Utc::now();
        let workers = self
            .repo
            .list_workers(
                &WorkerFilter::default().with_statuses(&[WorkerStatus::Idle, WorkerStatus::Busy]),
            )
            .await?;

        let mut reported = self.reported.lock().await;
        let mut failed = Vec::new();
        for worker in workers {
            if !self.is_worker_failed(&worker, now) {
                reported.remove(&worker.id);
                continue;
            }
            if reported.get(&worker.id) == Some(&worker.last_heartbeat) {
                continue;
            }
            warn!(
                "检测到失效Worker: {} (上次心跳: {})",
                worker.id,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );
            reported.insert(worker.id.clone(), worker.last_heartbeat);
            failed.push(worker);
        }
        Ok(failed)
    }

    /// 执行一轮检测并处理结果，返回处理成功的数量
    pub async fn run_once(&self) -> SchedulerResult<usize> {
        let failed = self.detect_failed_workers().await?;
        if failed.is_empty() {
            return Ok(0);
        }
        info!("检测到 {} 个失效的Worker", failed.len());

        let mut handled = 0;
        for worker in failed {
            match self.handler.handle_worker_failure(&worker.id).await {
                Ok(()) => handled += 1,
                Err(e) => {
                    error!("处理失效Worker {} 时出错: {}", worker.id, e);
                    // 下一轮重新报告
                    self.reported.lock().await.remove(&worker.id);
                }
            }
        }
        Ok(handled)
    }

    /// 检测循环，直到 [`shutdown`](Self::shutdown) 被调用
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Worker失效检测已禁用");
            return;
        }
        info!(
            "启动Worker失效检测循环，间隔 {} 秒，超时 {} 秒",
            self.config.detection_interval_seconds, self.config.heartbeat_timeout_seconds
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.detection_interval_seconds,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Worker失效检测时出错: {}", e);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Worker失效检测循环已退出");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
