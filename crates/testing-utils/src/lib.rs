//! # Scheduler Testing Utils
//!
//! 各crate共享的测试工具：
//!
//! - **Builders**: 带合理默认值的实体构造器
//! - **Mocks**: 记录调用的事件发布器、Worker通道与数据移动服务
//! - **Flaky**: 按需让事务或连通性检查失败的仓储包装
//! - **Helpers**: 等待异步条件成立等通用辅助
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod flaky;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use flaky::*;
pub use helpers::*;
pub use mocks::*;
