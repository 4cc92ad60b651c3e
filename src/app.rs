use std::sync::Arc;

use anyhow::{Context, Result};
use scheduler_core::AppConfig;
use scheduler_dispatcher::{SchedulerService, WorkerFailureDetector, WorkerFailureHandler};
use scheduler_domain::{event_types, EventBus, EventPublisher};
use scheduler_infrastructure::{
    DatabaseManager, InProcessEventBus, LocalDataMover, LoggingWorkerTransport,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 主应用程序：持有全部长生命周期组件
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    event_bus: Arc<InProcessEventBus>,
    scheduler: Arc<SchedulerService>,
    detector: Arc<WorkerFailureDetector>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        database.migrate().await.context("执行数据库迁移失败")?;
        let repo = database.repository();

        let event_bus = Arc::new(InProcessEventBus::new());
        let data_mover = Arc::new(LocalDataMover::new(config.staging.staging_root.clone()));
        let transport = Arc::new(LoggingWorkerTransport);

        let scheduler = Arc::new(SchedulerService::new(
            Arc::clone(&repo),
            Arc::clone(&event_bus) as Arc<dyn EventPublisher>,
            data_mover,
            transport,
            &config,
        ));

        let detector = Arc::new(WorkerFailureDetector::new(
            repo,
            Arc::clone(&scheduler) as Arc<dyn WorkerFailureHandler>,
            config.worker_detector.clone(),
        ));

        Ok(Self {
            config,
            database,
            event_bus,
            scheduler,
            detector,
        })
    }

    /// 运行直到收到关闭信号，然后按依赖顺序逐个停止组件
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动调度服务");

        if self.config.scheduler.event_driven_assignment {
            self.event_bus
                .subscribe(event_types::TASK_QUEUED, self.scheduler.task_queued_handler())
                .await
                .context("订阅任务入队事件失败")?;
            info!("已启用事件驱动的任务分配");
        }

        self.scheduler.staging_manager().start_sweep().await;

        match self.scheduler.resume_staging().await {
            Ok(0) => {}
            Ok(count) => info!("重新接管了 {} 个进行中的暂存操作", count),
            Err(e) => warn!("恢复暂存操作失败: {}", e),
        }

        let detector = Arc::clone(&self.detector);
        let detector_handle = tokio::spawn(async move { detector.run().await });

        info!("调度服务已就绪");
        let _ = shutdown_rx.recv().await;

        info!("开始停止调度服务组件");
        self.detector.shutdown();
        if let Err(e) = detector_handle.await {
            error!("Worker失效检测循环异常退出: {}", e);
        }
        if let Err(e) = self.scheduler.shutdown().await {
            error!("关闭调度服务失败: {}", e);
        }
        if let Err(e) = self.event_bus.shutdown().await {
            error!("关闭事件总线失败: {}", e);
        }
        self.database.close().await;

        info!("调度服务已停止");
        Ok(())
    }
}
