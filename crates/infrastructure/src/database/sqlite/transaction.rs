use async_trait::async_trait;
use scheduler_domain::{
    Experiment, ExperimentStatus, RepositoryTransaction, Task, TaskGuard, Worker, WorkerStatus,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{Sqlite, Transaction};

use super::rows;

/// 包装一个SQLite事务；丢弃前未提交则由sqlx自动回滚
pub struct SqliteRepositoryTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteRepositoryTransaction {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RepositoryTransaction for SqliteRepositoryTransaction {
    async fn get_task(&mut self, id: &str) -> SchedulerResult<Option<Task>> {
        rows::fetch_task(&mut *self.tx, id).await
    }

    async fn get_worker(&mut self, id: &str) -> SchedulerResult<Option<Worker>> {
        rows::fetch_worker(&mut *self.tx, id).await
    }

    async fn get_experiment(&mut self, id: &str) -> SchedulerResult<Option<Experiment>> {
        rows::fetch_experiment(&mut *self.tx, id).await
    }

    async fn update_task_guarded(
        &mut self,
        task: &Task,
        guard: TaskGuard,
    ) -> SchedulerResult<bool> {
        let affected = rows::update_task_row(&mut *self.tx, task, Some(guard)).await?;
        Ok(affected > 0)
    }

    async fn update_worker_guarded(
        &mut self,
        worker: &Worker,
        expected: WorkerStatus,
    ) -> SchedulerResult<bool> {
        let affected = rows::update_worker_row(&mut *self.tx, worker, Some(expected)).await?;
        Ok(affected > 0)
    }

    async fn update_experiment_guarded(
        &mut self,
        experiment: &Experiment,
        expected: ExperimentStatus,
    ) -> SchedulerResult<bool> {
        let affected =
            rows::update_experiment_row(&mut *self.tx, experiment, Some(expected)).await?;
        Ok(affected > 0)
    }

    async fn commit(self: Box<Self>) -> SchedulerResult<()> {
        self.tx.commit().await.map_err(SchedulerError::Database)
    }

    async fn rollback(self: Box<Self>) -> SchedulerResult<()> {
        self.tx.rollback().await.map_err(SchedulerError::Database)
    }
}
