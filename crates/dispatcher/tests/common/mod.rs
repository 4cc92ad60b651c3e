//! 集成测试共用的调度环境
#![allow(dead_code)]

use std::sync::Arc;

use scheduler_core::AppConfig;
use scheduler_dispatcher::SchedulerService;
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, EventPublisher, Experiment, ExperimentRepository,
    Repository, Task, TaskRepository, Worker, WorkerRepository,
};
use scheduler_infrastructure::InMemoryRepository;
use scheduler_testing_utils::{
    FlakyRepository, MockDataMover, RecordingEventPublisher, RecordingWorkerTransport,
    StagingBehavior,
};

/// 缩短监控间隔，让暂存相关测试在秒级完成
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.staging.monitor_interval_seconds = 1;
    config.staging.monitor_timeout_seconds = 5;
    config.scheduler.job_heartbeat_interval_seconds = 1;
    config.scheduler.shutdown_timeout_seconds = 5;
    config
}

pub struct Harness {
    pub repo: Arc<InMemoryRepository>,
    pub events: RecordingEventPublisher,
    pub data_mover: MockDataMover,
    pub transport: RecordingWorkerTransport,
    pub scheduler: Arc<SchedulerService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_behavior(StagingBehavior::Manual)
    }

    pub fn with_behavior(behavior: StagingBehavior) -> Self {
        Self::build(test_config(), behavior, None)
    }

    /// 使用指定的事件发布器（例如真实的进程内事件总线）
    pub fn with_publisher(publisher: Arc<dyn EventPublisher>) -> Self {
        Self::build(test_config(), StagingBehavior::Manual, Some(publisher))
    }

    /// 调度服务经由可注入故障的仓储访问存储，断言仍可直接读内存仓储
    pub fn flaky() -> (Self, FlakyRepository) {
        let repo = Arc::new(InMemoryRepository::new());
        let flaky = FlakyRepository::new(repo.clone());
        let harness = Self::assemble(
            repo,
            Arc::new(flaky.clone()),
            test_config(),
            StagingBehavior::Manual,
            None,
        );
        (harness, flaky)
    }

    fn build(
        config: AppConfig,
        behavior: StagingBehavior,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        Self::assemble(repo.clone(), repo, config, behavior, publisher)
    }

    fn assemble(
        repo: Arc<InMemoryRepository>,
        store: Arc<dyn Repository>,
        config: AppConfig,
        behavior: StagingBehavior,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        let events = RecordingEventPublisher::new();
        let data_mover = MockDataMover::new(behavior);
        let transport = RecordingWorkerTransport::new();
        let publisher = publisher.unwrap_or_else(|| Arc::new(events.clone()));

        let scheduler = Arc::new(SchedulerService::new(
            store,
            publisher,
            Arc::new(data_mover.clone()),
            Arc::new(transport.clone()),
            &config,
        ));
        Self {
            repo,
            events,
            data_mover,
            transport,
            scheduler,
        }
    }

    pub async fn add_resource(&self, resource: ComputeResource) -> ComputeResource {
        self.repo.create_compute_resource(&resource).await.unwrap();
        resource
    }

    pub async fn add_experiment(&self, experiment: Experiment) -> Experiment {
        self.repo.create_experiment(&experiment).await.unwrap();
        experiment
    }

    pub async fn add_task(&self, task: Task) -> Task {
        self.repo.create_task(&task).await.unwrap();
        task
    }

    pub async fn add_worker(&self, worker: Worker) -> Worker {
        self.repo.create_worker(&worker).await.unwrap();
        worker
    }

    pub async fn task(&self, id: &str) -> Task {
        self.repo.get_task(id).await.unwrap().unwrap()
    }

    pub async fn worker(&self, id: &str) -> Worker {
        self.repo.get_worker(id).await.unwrap().unwrap()
    }

    pub async fn experiment(&self, id: &str) -> Experiment {
        self.repo.get_experiment(id).await.unwrap().unwrap()
    }

    pub async fn resource(&self, id: &str) -> ComputeResource {
        self.repo.get_compute_resource(id).await.unwrap().unwrap()
    }
}
