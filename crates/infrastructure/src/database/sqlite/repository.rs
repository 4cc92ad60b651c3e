use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    ComputeResource, ComputeResourceRepository, ComputeResourceStatus, Experiment,
    ExperimentRepository, Repository, RepositoryTransaction, StagingOperation,
    StagingOperationFilter, StagingOperationRepository, StagingOperationStatus, Task, TaskFilter,
    TaskRepository, Worker, WorkerFilter, WorkerMetrics, WorkerMetricsRepository,
    WorkerRepository,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use super::rows::{self, json_text};
use super::transaction::SqliteRepositoryTransaction;

/// 基于SQLite的仓储实现
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskRepository for SqliteRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn create_task(&self, task: &Task) -> SchedulerResult<()> {
        rows::insert_task(&self.pool, task).await?;
        debug!("创建任务: {}", task.id);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        rows::fetch_task(&self.pool, id).await
    }

    async fn update_task(&self, task: &Task) -> SchedulerResult<()> {
        let affected = rows::update_task_row(&self.pool, task, None).await?;
        if affected == 0 {
            return Err(SchedulerError::task_not_found(&task.id));
        }
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        rows::select_tasks(&self.pool, filter).await
    }
}

#[async_trait]
impl WorkerRepository for SqliteRepository {
    async fn create_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        rows::insert_worker(&self.pool, worker).await?;
        debug!("注册Worker成功: {}", worker.id);
        Ok(())
    }

    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<Worker>> {
        rows::fetch_worker(&self.pool, id).await
    }

    async fn update_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        let affected = rows::update_worker_row(&self.pool, worker, None).await?;
        if affected == 0 {
            return Err(SchedulerError::worker_not_found(&worker.id));
        }
        Ok(())
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> SchedulerResult<Vec<Worker>> {
        rows::select_workers(&self.pool, filter).await
    }
}

#[async_trait]
impl ExperimentRepository for SqliteRepository {
    async fn create_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        rows::insert_experiment(&self.pool, experiment).await?;
        debug!("创建实验: {} ({})", experiment.name, experiment.id);
        Ok(())
    }

    async fn get_experiment(&self, id: &str) -> SchedulerResult<Option<Experiment>> {
        rows::fetch_experiment(&self.pool, id).await
    }

    async fn update_experiment(&self, experiment: &Experiment) -> SchedulerResult<()> {
        let affected = rows::update_experiment_row(&self.pool, experiment, None).await?;
        if affected == 0 {
            return Err(SchedulerError::experiment_not_found(&experiment.id));
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeResourceRepository for SqliteRepository {
    async fn create_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO compute_resources (id, name, resource_type, status, max_workers,
                current_workers, cost_per_hour, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.name)
        .bind(resource.resource_type)
        .bind(resource.status)
        .bind(resource.max_workers)
        .bind(resource.current_workers)
        .bind(resource.cost_per_hour)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("注册计算资源: {} ({})", resource.name, resource.id);
        Ok(())
    }

    async fn get_compute_resource(&self, id: &str) -> SchedulerResult<Option<ComputeResource>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", rows::SELECT_COMPUTE_RESOURCES))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        row.as_ref().map(rows::compute_resource_from_row).transpose()
    }

    async fn update_compute_resource(&self, resource: &ComputeResource) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE compute_resources SET name = $2, resource_type = $3, status = $4,
                max_workers = $5, current_workers = $6, cost_per_hour = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.name)
        .bind(resource.resource_type)
        .bind(resource.status)
        .bind(resource.max_workers)
        .bind(resource.current_workers)
        .bind(resource.cost_per_hour)
        .bind(resource.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::compute_resource_not_found(&resource.id));
        }
        Ok(())
    }

    async fn list_compute_resources(
        &self,
        status: Option<ComputeResourceStatus>,
    ) -> SchedulerResult<Vec<ComputeResource>> {
        let mut qb = QueryBuilder::<Sqlite>::new(rows::SELECT_COMPUTE_RESOURCES);
        if let Some(status) = status {
            qb.push(" WHERE status = ").push_bind(status);
        }
        qb.push(" ORDER BY created_at ASC, rowid ASC");

        let result = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        result.iter().map(rows::compute_resource_from_row).collect()
    }
}

#[async_trait]
impl StagingOperationRepository for SqliteRepository {
    async fn create_staging_operation(&self, op: &StagingOperation) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO staging_operations (id, task_id, worker_id, compute_resource_id, status,
                source_path, destination_path, total_size, transferred_size, transfer_rate,
                error_message, timeout_seconds, started_at, completed_at, transfer_finished_at,
                last_heartbeat, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&op.id)
        .bind(&op.task_id)
        .bind(&op.worker_id)
        .bind(&op.compute_resource_id)
        .bind(op.status)
        .bind(&op.source_path)
        .bind(&op.destination_path)
        .bind(op.total_size)
        .bind(op.transferred_size)
        .bind(op.transfer_rate)
        .bind(&op.error_message)
        .bind(op.timeout_seconds)
        .bind(op.started_at)
        .bind(op.completed_at)
        .bind(op.transfer_finished_at)
        .bind(op.last_heartbeat)
        .bind(json_text(&op.metadata, "暂存操作元数据")?)
        .bind(op.created_at)
        .bind(op.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn get_staging_operation(&self, id: &str) -> SchedulerResult<Option<StagingOperation>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", rows::SELECT_STAGING_OPERATIONS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        row.as_ref().map(rows::staging_operation_from_row).transpose()
    }

    async fn get_staging_operation_by_task(
        &self,
        task_id: &str,
    ) -> SchedulerResult<Option<StagingOperation>> {
        let row = sqlx::query(&format!(
            "{} WHERE task_id = $1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            rows::SELECT_STAGING_OPERATIONS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        row.as_ref().map(rows::staging_operation_from_row).transpose()
    }

    async fn update_staging_operation(
        &self,
        op: &StagingOperation,
        expected: &[StagingOperationStatus],
    ) -> SchedulerResult<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE staging_operations SET status = ");
        qb.push_bind(op.status)
            .push(", source_path = ")
            .push_bind(op.source_path.clone())
            .push(", destination_path = ")
            .push_bind(op.destination_path.clone())
            .push(", total_size = ")
            .push_bind(op.total_size)
            .push(", transferred_size = ")
            .push_bind(op.transferred_size)
            .push(", transfer_rate = ")
            .push_bind(op.transfer_rate)
            .push(", error_message = ")
            .push_bind(op.error_message.clone())
            .push(", timeout_seconds = ")
            .push_bind(op.timeout_seconds)
            .push(", started_at = ")
            .push_bind(op.started_at)
            .push(", completed_at = ")
            .push_bind(op.completed_at)
            .push(", transfer_finished_at = ")
            .push_bind(op.transfer_finished_at)
            .push(", last_heartbeat = ")
            .push_bind(op.last_heartbeat)
            .push(", metadata = ")
            .push_bind(json_text(&op.metadata, "暂存操作元数据")?)
            .push(", updated_at = ")
            .push_bind(op.updated_at)
            .push(" WHERE id = ")
            .push_bind(op.id.clone());
        if !expected.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in expected {
                separated.push_bind(*status);
            }
            separated.push_unseparated(")");
        }

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_staging_operations(
        &self,
        filter: &StagingOperationFilter,
    ) -> SchedulerResult<Vec<StagingOperation>> {
        let mut qb = rows::staging_filter_query(filter);
        let result = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        result.iter().map(rows::staging_operation_from_row).collect()
    }

    async fn delete_staging_operation(&self, id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM staging_operations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_staging_operations_before(
        &self,
        statuses: &[StagingOperationStatus],
        before: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM staging_operations WHERE status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");
        qb.push(" AND updated_at < ").push_bind(before);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkerMetricsRepository for SqliteRepository {
    async fn record_worker_metrics(&self, metrics: &WorkerMetrics) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_metrics (worker_id, cpu_usage_percent, memory_usage_percent,
                tasks_completed, tasks_failed, average_task_duration_ms, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&metrics.worker_id)
        .bind(metrics.cpu_usage_percent)
        .bind(metrics.memory_usage_percent)
        .bind(metrics.tasks_completed)
        .bind(metrics.tasks_failed)
        .bind(metrics.average_task_duration_ms)
        .bind(metrics.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn get_latest_worker_metrics(
        &self,
        worker_id: &str,
    ) -> SchedulerResult<Option<WorkerMetrics>> {
        let row = sqlx::query(&format!(
            "{} WHERE worker_id = $1 ORDER BY recorded_at DESC, id DESC LIMIT 1",
            rows::SELECT_WORKER_METRICS
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        row.as_ref().map(rows::worker_metrics_from_row).transpose()
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn begin(&self) -> SchedulerResult<Box<dyn RepositoryTransaction>> {
        // 立即取得写锁，并发写事务在busy_timeout内排队而不是在提交时冲突
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(SchedulerError::Database)?;
        Ok(Box::new(SqliteRepositoryTransaction::new(tx)))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }
}
