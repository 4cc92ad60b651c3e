//! 后台任务管理
//!
//! 跟踪调度器派生的长时间任务（如暂存监控），为每个运行中的任务定期刷新心跳，
//! 关闭时停止心跳并等待所有任务结束。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// 运行中后台任务的快照
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

pub struct BackgroundJobManager {
    heartbeat_interval: Duration,
    jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl BackgroundJobManager {
    pub fn new(heartbeat_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            heartbeat_interval,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// 派生一个受跟踪的后台任务，返回任务ID
    pub async fn spawn<F>(&self, name: &str, job: F) -> SchedulerResult<String>
    where
        F: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::InvalidState(format!(
                "后台任务管理器正在关闭，拒绝新任务 {name}"
            )));
        }

        let id = format!("{}-{}", name, self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = Utc::now();
        self.jobs.lock().await.insert(
            id.clone(),
            JobInfo {
                id: id.clone(),
                name: name.to_string(),
                started_at: now,
                last_heartbeat: now,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let period = self.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let job_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::pin!(job);
            let mut heartbeat = interval_at(Instant::now() + period, period);
            let mut heartbeats_stopped = *shutdown_rx.borrow();

            let result = loop {
                tokio::select! {
                    result = &mut job => break result,
                    _ = heartbeat.tick(), if !heartbeats_stopped => {
                        if let Some(info) = jobs.lock().await.get_mut(&job_id) {
                            info.last_heartbeat = Utc::now();
                        }
                        debug!("后台任务 {} 心跳", job_id);
                    }
                    changed = shutdown_rx.changed(), if !heartbeats_stopped => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            heartbeats_stopped = true;
                        }
                    }
                }
            };

            jobs.lock().await.remove(&job_id);
            match result {
                Ok(()) => debug!("后台任务 {} 已完成", job_id),
                Err(e) => error!("后台任务 {} 执行失败: {}", job_id, e),
            }
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        debug!("已启动后台任务 {}", id);
        Ok(id)
    }

    pub async fn running_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub async fn active_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 停止心跳并在超时内等待所有任务结束
    pub async fn shutdown(&self, timeout: Duration) -> SchedulerResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        if handles.is_empty() {
            return Ok(());
        }
        info!("等待 {} 个后台任务结束", handles.len());

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("后台任务异常退出: {}", e);
                    }
                }
                info!("所有后台任务已结束");
                Ok(())
            }
            Err(_) => Err(SchedulerError::Timeout(format!(
                "后台任务在 {:?} 内未能结束",
                timeout
            ))),
        }
    }
}
