use async_trait::async_trait;
use scheduler_errors::SchedulerResult;

/// 面向Worker的控制通道
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn shutdown_worker(&self, worker_id: &str, reason: &str, graceful: bool)
        -> SchedulerResult<()>;
}
