//! 调度核心
//!
//! 状态管理、任务分配、Worker池优化、数据暂存与失效检测。所有存储与外部协作者
//! 都通过 `scheduler-domain` 中的端口注入。

pub mod background_jobs;
pub mod cost;
pub mod optimizer;
pub mod scheduler;
pub mod staging_manager;
pub mod state_manager;
pub mod worker_failure_detector;

pub use background_jobs::{BackgroundJobManager, JobInfo};
pub use optimizer::{CostModel, ExperimentAnalysis, SchedulingOptimizer, WorkerPoolPlan};
pub use scheduler::{
    SchedulerService, SchedulingPlan, TaskQueuedHandler, WorkerDistribution, WorkerStatusInfo,
};
pub use staging_manager::{MonitorOutcome, StagingOperationManager, StagingStats, SweepReport};
pub use state_manager::{StateManager, TaskTransition};
pub use worker_failure_detector::{WorkerFailureDetector, WorkerFailureHandler};
