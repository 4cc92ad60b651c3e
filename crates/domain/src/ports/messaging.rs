use std::sync::Arc;

use async_trait::async_trait;
use scheduler_errors::SchedulerResult;

use crate::events::DomainEvent;

/// 事件发布接口
///
/// 发布是即发即忘的：实现只负责校验与投递，不等待处理器执行完成。
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> SchedulerResult<()>;
}

/// 进程内事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> SchedulerResult<()>;

    fn name(&self) -> &str {
        "anonymous"
    }
}

/// 支持订阅的事件总线
#[async_trait]
pub trait EventBus: EventPublisher {
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SchedulerResult<()>;

    /// 停止分发并等待已入队的事件处理完毕
    async fn shutdown(&self) -> SchedulerResult<()>;
}
