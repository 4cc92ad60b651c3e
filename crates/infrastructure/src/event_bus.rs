use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use scheduler_domain::{DomainEvent, EventBus, EventHandler, EventPublisher};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 订阅所有事件类型
pub const ALL_EVENTS: &str = "*";

struct Subscription {
    handler_name: String,
    sender: mpsc::UnboundedSender<Arc<DomainEvent>>,
}

/// 进程内事件总线
///
/// 每个订阅拥有独立的通道与分发任务：同一订阅内事件按发布顺序串行处理，
/// 不同订阅之间互不阻塞。处理器的错误只记录日志。
#[derive(Default)]
pub struct InProcessEventBus {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    published: AtomicU64,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已接受发布的事件数量
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventPublisher for InProcessEventBus {
    async fn publish(&self, event: DomainEvent) -> SchedulerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::EventPublish("事件总线已关闭".to_string()));
        }
        event.validate()?;

        let event = Arc::new(event);
        let subscriptions = self.subscriptions.read().await;
        let targets = subscriptions
            .get(event.event_type.as_str())
            .into_iter()
            .chain(subscriptions.get(ALL_EVENTS))
            .flatten();

        for subscription in targets {
            if subscription.sender.send(Arc::clone(&event)).is_err() {
                warn!(
                    "事件处理器 {} 已停止，丢弃事件 {} ({})",
                    subscription.handler_name, event.event_type, event.id
                );
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!("发布事件: {} -> {}", event.event_type, event.aggregate_id());
        Ok(())
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SchedulerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::EventPublish("事件总线已关闭".to_string()));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<DomainEvent>>();
        let handler_name = handler.name().to_string();

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = handler.handle(&event).await {
                    warn!(
                        "事件处理器 {} 处理 {} ({}) 失败: {}",
                        handler.name(),
                        event.event_type,
                        event.id,
                        e
                    );
                }
            }
            debug!("事件处理器 {} 的分发任务退出", handler.name());
        });

        self.subscriptions
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(Subscription {
                handler_name: handler_name.clone(),
                sender,
            });
        self.dispatchers.lock().await.push(dispatcher);

        info!("事件处理器 {} 订阅了 {}", handler_name, event_type);
        Ok(())
    }

    async fn shutdown(&self) -> SchedulerResult<()> {
        self.closed.store(true, Ordering::Release);

        // 关闭发送端后，分发任务处理完剩余事件即退出
        self.subscriptions.write().await.clear();

        let handles: Vec<_> = self.dispatchers.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("事件分发任务异常退出: {}", e);
            }
        }

        info!("事件总线已关闭");
        Ok(())
    }
}
