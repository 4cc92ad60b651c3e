use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 关闭信号只发送一次；关闭之后的订阅者会拿到一个立即就绪的接收器。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭，重复调用无效果
    pub async fn shutdown(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }

        info!("触发系统关闭");
        debug!("发送关闭信号给 {} 个订阅者", self.shutdown_tx.receiver_count());
        // 没有订阅者时发送失败，忽略
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for_shutdown(manager: &ShutdownManager) {
        let mut rx = manager.subscribe().await;
        let _ = rx.recv().await;
    }

    #[tokio::test]
    async fn test_shutdown_reaches_every_subscriber() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());

        let mut receivers = vec![
            manager.subscribe().await,
            manager.subscribe().await,
            manager.subscribe().await,
        ];
        manager.shutdown().await;

        for rx in receivers.iter_mut() {
            let result = timeout(Duration::from_millis(100), rx.recv()).await;
            assert!(result.is_ok());
        }
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;

        // 关闭之后订阅应立即收到信号
        let mut rx = manager.subscribe().await;
        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_double_shutdown_sends_once() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe().await;

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutdown());

        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_across_clones() {
        let manager = ShutdownManager::new();
        let waiter = manager.clone();
        let handle = tokio::spawn(async move { wait_for_shutdown(&waiter).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown().await;

        let result = timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok());
    }
}
