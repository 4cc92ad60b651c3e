use async_trait::async_trait;
use scheduler_domain::WorkerTransport;
use scheduler_errors::SchedulerResult;
use tracing::info;

/// 仅记录关闭指令的Worker通道
///
/// Worker进程由外部资源管理器托管时，调度器只需留下关闭记录。
#[derive(Debug, Default, Clone)]
pub struct LoggingWorkerTransport;

#[async_trait]
impl WorkerTransport for LoggingWorkerTransport {
    async fn shutdown_worker(
        &self,
        worker_id: &str,
        reason: &str,
        graceful: bool,
    ) -> SchedulerResult<()> {
        info!(
            worker_id = worker_id,
            graceful = graceful,
            "发送Worker关闭指令: {}",
            reason
        );
        Ok(())
    }
}
