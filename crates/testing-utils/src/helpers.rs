//! 测试辅助工具

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// 在超时前轮询条件，成立时返回 true
    pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(20)).await
    }

    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(poll_interval).await;
        }
        condition().await
    }

    pub fn unique_name(prefix: &str) -> String {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        format!("{}_{}", prefix, timestamp)
    }
}
