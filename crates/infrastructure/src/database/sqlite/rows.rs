//! 行映射与语句
//!
//! 所有函数对执行器泛型，连接池与事务共用同一套SQL。

use serde::{de::DeserializeOwned, Serialize};
use scheduler_domain::{
    ComputeResource, Experiment, ExperimentStatus, StagingOperation, StagingOperationFilter,
    Task, TaskFilter, TaskGuard, Worker, WorkerFilter, WorkerMetrics, WorkerStatus,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::{sqlite::SqliteRow, Executor, QueryBuilder, Row, Sqlite};

const SELECT_TASKS: &str = "SELECT id, experiment_id, status, command, execution_script, worker_id, compute_resource_id, input_files, output_files, retry_count, max_retries, error, result_summary, metadata, created_at, updated_at, started_at, completed_at, duration_ms FROM tasks";

const SELECT_WORKERS: &str = "SELECT id, compute_resource_id, experiment_id, user_id, status, current_task_id, walltime_seconds, walltime_remaining_seconds, last_heartbeat, registered_at, updated_at, terminated_at, metadata FROM workers";

const SELECT_EXPERIMENTS: &str = "SELECT id, name, status, parameters, command_template, requirements, constraints, owner_id, metadata, created_at, updated_at, started_at, completed_at FROM experiments";

pub(crate) const SELECT_COMPUTE_RESOURCES: &str = "SELECT id, name, resource_type, status, max_workers, current_workers, cost_per_hour, created_at, updated_at FROM compute_resources";

pub(crate) const SELECT_STAGING_OPERATIONS: &str = "SELECT id, task_id, worker_id, compute_resource_id, status, source_path, destination_path, total_size, transferred_size, transfer_rate, error_message, timeout_seconds, started_at, completed_at, transfer_finished_at, last_heartbeat, metadata, created_at, updated_at FROM staging_operations";

pub(crate) const SELECT_WORKER_METRICS: &str = "SELECT worker_id, cpu_usage_percent, memory_usage_percent, tasks_completed, tasks_failed, average_task_duration_ms, recorded_at FROM worker_metrics";

pub(crate) fn json_text<T: Serialize>(value: &T, field: &str) -> SchedulerResult<String> {
    serde_json::to_string(value)
        .map_err(|e| SchedulerError::Serialization(format!("序列化{field}失败: {e}")))
}

fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> SchedulerResult<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| SchedulerError::Serialization(format!("解析{column}失败: {e}")))
}

pub(crate) fn task_from_row(row: &SqliteRow) -> SchedulerResult<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        experiment_id: row.try_get("experiment_id")?,
        status: row.try_get("status")?,
        command: row.try_get("command")?,
        execution_script: row.try_get("execution_script")?,
        worker_id: row.try_get("worker_id")?,
        compute_resource_id: row.try_get("compute_resource_id")?,
        input_files: json_column(row, "input_files")?,
        output_files: json_column(row, "output_files")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error: row.try_get("error")?,
        result_summary: row.try_get("result_summary")?,
        metadata: json_column(row, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

pub(crate) fn worker_from_row(row: &SqliteRow) -> SchedulerResult<Worker> {
    Ok(Worker {
        id: row.try_get("id")?,
        compute_resource_id: row.try_get("compute_resource_id")?,
        experiment_id: row.try_get("experiment_id")?,
        user_id: row.try_get("user_id")?,
        status: row.try_get("status")?,
        current_task_id: row.try_get("current_task_id")?,
        walltime_seconds: row.try_get("walltime_seconds")?,
        walltime_remaining_seconds: row.try_get("walltime_remaining_seconds")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        registered_at: row.try_get("registered_at")?,
        updated_at: row.try_get("updated_at")?,
        terminated_at: row.try_get("terminated_at")?,
        metadata: json_column(row, "metadata")?,
    })
}

pub(crate) fn experiment_from_row(row: &SqliteRow) -> SchedulerResult<Experiment> {
    Ok(Experiment {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        parameters: json_column(row, "parameters")?,
        command_template: row.try_get("command_template")?,
        requirements: json_column(row, "requirements")?,
        constraints: json_column(row, "constraints")?,
        owner_id: row.try_get("owner_id")?,
        metadata: json_column(row, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub(crate) fn compute_resource_from_row(row: &SqliteRow) -> SchedulerResult<ComputeResource> {
    Ok(ComputeResource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        resource_type: row.try_get("resource_type")?,
        status: row.try_get("status")?,
        max_workers: row.try_get("max_workers")?,
        current_workers: row.try_get("current_workers")?,
        cost_per_hour: row.try_get("cost_per_hour")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn staging_operation_from_row(row: &SqliteRow) -> SchedulerResult<StagingOperation> {
    Ok(StagingOperation {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        worker_id: row.try_get("worker_id")?,
        compute_resource_id: row.try_get("compute_resource_id")?,
        status: row.try_get("status")?,
        source_path: row.try_get("source_path")?,
        destination_path: row.try_get("destination_path")?,
        total_size: row.try_get("total_size")?,
        transferred_size: row.try_get("transferred_size")?,
        transfer_rate: row.try_get("transfer_rate")?,
        error_message: row.try_get("error_message")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        transfer_finished_at: row.try_get("transfer_finished_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        metadata: json_column(row, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn worker_metrics_from_row(row: &SqliteRow) -> SchedulerResult<WorkerMetrics> {
    Ok(WorkerMetrics {
        worker_id: row.try_get("worker_id")?,
        cpu_usage_percent: row.try_get("cpu_usage_percent")?,
        memory_usage_percent: row.try_get("memory_usage_percent")?,
        tasks_completed: row.try_get("tasks_completed")?,
        tasks_failed: row.try_get("tasks_failed")?,
        average_task_duration_ms: row.try_get("average_task_duration_ms")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

// ---- tasks ----

pub(crate) async fn fetch_task<'e, E>(executor: E, id: &str) -> SchedulerResult<Option<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{SELECT_TASKS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(SchedulerError::Database)?;
    row.as_ref().map(task_from_row).transpose()
}

pub(crate) async fn insert_task<'e, E>(executor: E, task: &Task) -> SchedulerResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO tasks (id, experiment_id, status, command, execution_script, worker_id,
            compute_resource_id, input_files, output_files, retry_count, max_retries, error,
            result_summary, metadata, created_at, updated_at, started_at, completed_at, duration_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(&task.id)
    .bind(&task.experiment_id)
    .bind(task.status)
    .bind(&task.command)
    .bind(&task.execution_script)
    .bind(&task.worker_id)
    .bind(&task.compute_resource_id)
    .bind(json_text(&task.input_files, "输入文件")?)
    .bind(json_text(&task.output_files, "输出文件")?)
    .bind(task.retry_count)
    .bind(task.max_retries)
    .bind(&task.error)
    .bind(&task.result_summary)
    .bind(json_text(&task.metadata, "任务元数据")?)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.duration_ms)
    .execute(executor)
    .await
    .map_err(SchedulerError::Database)?;
    Ok(())
}

/// 写回整行；给定 `guard` 时只在持久化状态满足条件时生效。返回影响行数
pub(crate) async fn update_task_row<'e, E>(
    executor: E,
    task: &Task,
    guard: Option<TaskGuard>,
) -> SchedulerResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut sql = String::from(
        r#"
        UPDATE tasks SET experiment_id = $2, status = $3, command = $4, execution_script = $5,
            worker_id = $6, compute_resource_id = $7, input_files = $8, output_files = $9,
            retry_count = $10, max_retries = $11, error = $12, result_summary = $13,
            metadata = $14, updated_at = $15, started_at = $16, completed_at = $17,
            duration_ms = $18
        WHERE id = $1
        "#,
    );
    if let Some(guard) = guard {
        sql.push_str(" AND status = $19");
        if guard.worker_unassigned {
            sql.push_str(" AND worker_id IS NULL");
        }
        if guard.resource_unassigned {
            sql.push_str(" AND compute_resource_id IS NULL");
        }
    }

    let mut query = sqlx::query(&sql)
        .bind(&task.id)
        .bind(&task.experiment_id)
        .bind(task.status)
        .bind(&task.command)
        .bind(&task.execution_script)
        .bind(&task.worker_id)
        .bind(&task.compute_resource_id)
        .bind(json_text(&task.input_files, "输入文件")?)
        .bind(json_text(&task.output_files, "输出文件")?)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.error)
        .bind(&task.result_summary)
        .bind(json_text(&task.metadata, "任务元数据")?)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.duration_ms);
    if let Some(guard) = guard {
        query = query.bind(guard.status);
    }

    let result = query
        .execute(executor)
        .await
        .map_err(SchedulerError::Database)?;
    Ok(result.rows_affected())
}

pub(crate) async fn select_tasks<'e, E>(executor: E, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_TASKS);
    qb.push(" WHERE 1 = 1");
    if let Some(experiment_id) = &filter.experiment_id {
        qb.push(" AND experiment_id = ").push_bind(experiment_id.clone());
    }
    if !filter.statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");
    }
    if let Some(resource_id) = &filter.compute_resource_id {
        qb.push(" AND compute_resource_id = ").push_bind(resource_id.clone());
    }
    if let Some(worker_id) = &filter.worker_id {
        qb.push(" AND worker_id = ").push_bind(worker_id.clone());
    }
    if filter.worker_unassigned {
        qb.push(" AND worker_id IS NULL");
    }
    qb.push(" ORDER BY created_at ASC, rowid ASC");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    let rows = qb
        .build()
        .fetch_all(executor)
        .await
        .map_err(SchedulerError::Database)?;
    rows.iter().map(task_from_row).collect()
}

// ---- workers ----

pub(crate) async fn fetch_worker<'e, E>(executor: E, id: &str) -> SchedulerResult<Option<Worker>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{SELECT_WORKERS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(SchedulerError::Database)?;
    row.as_ref().map(worker_from_row).transpose()
}

pub(crate) async fn insert_worker<'e, E>(executor: E, worker: &Worker) -> SchedulerResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO workers (id, compute_resource_id, experiment_id, user_id, status, current_task_id,
            walltime_seconds, walltime_remaining_seconds, last_heartbeat, registered_at, updated_at,
            terminated_at, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&worker.id)
    .bind(&worker.compute_resource_id)
    .bind(&worker.experiment_id)
    .bind(&worker.user_id)
    .bind(worker.status)
    .bind(&worker.current_task_id)
    .bind(worker.walltime_seconds)
    .bind(worker.walltime_remaining_seconds)
    .bind(worker.last_heartbeat)
    .bind(worker.registered_at)
    .bind(worker.updated_at)
    .bind(worker.terminated_at)
    .bind(json_text(&worker.metadata, "Worker元数据")?)
    .execute(executor)
    .await
    .map_err(SchedulerError::Database)?;
    Ok(())
}

pub(crate) async fn update_worker_row<'e, E>(
    executor: E,
    worker: &Worker,
    expected: Option<WorkerStatus>,
) -> SchedulerResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut sql = String::from(
        r#"
        UPDATE workers SET compute_resource_id = $2, experiment_id = $3, user_id = $4, status = $5,
            current_task_id = $6, walltime_seconds = $7, walltime_remaining_seconds = $8,
            last_heartbeat = $9, updated_at = $10, terminated_at = $11, metadata = $12
        WHERE id = $1
        "#,
    );
    if expected.is_some() {
        sql.push_str(" AND status = $13");
    }

    let mut query = sqlx::query(&sql)
        .bind(&worker.id)
        .bind(&worker.compute_resource_id)
        .bind(&worker.experiment_id)
        .bind(&worker.user_id)
        .bind(worker.status)
        .bind(&worker.current_task_id)
        .bind(worker.walltime_seconds)
        .bind(worker.walltime_remaining_seconds)
        .bind(worker.last_heartbeat)
        .bind(worker.updated_at)
        .bind(worker.terminated_at)
        .bind(json_text(&worker.metadata, "Worker元数据")?);
    if let Some(status) = expected {
        query = query.bind(status);
    }

    let result = query
        .execute(executor)
        .await
        .map_err(SchedulerError::Database)?;
    Ok(result.rows_affected())
}

pub(crate) async fn select_workers<'e, E>(
    executor: E,
    filter: &WorkerFilter,
) -> SchedulerResult<Vec<Worker>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_WORKERS);
    qb.push(" WHERE 1 = 1");
    if let Some(experiment_id) = &filter.experiment_id {
        qb.push(" AND experiment_id = ").push_bind(experiment_id.clone());
    }
    if let Some(resource_id) = &filter.compute_resource_id {
        qb.push(" AND compute_resource_id = ").push_bind(resource_id.clone());
    }
    if !filter.statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY registered_at ASC, rowid ASC");

    let rows = qb
        .build()
        .fetch_all(executor)
        .await
        .map_err(SchedulerError::Database)?;
    rows.iter().map(worker_from_row).collect()
}

// ---- experiments ----

pub(crate) async fn fetch_experiment<'e, E>(
    executor: E,
    id: &str,
) -> SchedulerResult<Option<Experiment>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{SELECT_EXPERIMENTS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(SchedulerError::Database)?;
    row.as_ref().map(experiment_from_row).transpose()
}

pub(crate) async fn insert_experiment<'e, E>(executor: E, experiment: &Experiment) -> SchedulerResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO experiments (id, name, status, parameters, command_template, requirements,
            constraints, owner_id, metadata, created_at, updated_at, started_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&experiment.id)
    .bind(&experiment.name)
    .bind(experiment.status)
    .bind(json_text(&experiment.parameters, "实验参数")?)
    .bind(&experiment.command_template)
    .bind(json_text(&experiment.requirements, "资源需求")?)
    .bind(json_text(&experiment.constraints, "实验约束")?)
    .bind(&experiment.owner_id)
    .bind(json_text(&experiment.metadata, "实验元数据")?)
    .bind(experiment.created_at)
    .bind(experiment.updated_at)
    .bind(experiment.started_at)
    .bind(experiment.completed_at)
    .execute(executor)
    .await
    .map_err(SchedulerError::Database)?;
    Ok(())
}

pub(crate) async fn update_experiment_row<'e, E>(
    executor: E,
    experiment: &Experiment,
    expected: Option<ExperimentStatus>,
) -> SchedulerResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut sql = String::from(
        r#"
        UPDATE experiments SET name = $2, status = $3, parameters = $4, command_template = $5,
            requirements = $6, constraints = $7, owner_id = $8, metadata = $9, updated_at = $10,
            started_at = $11, completed_at = $12
        WHERE id = $1
        "#,
    );
    if expected.is_some() {
        sql.push_str(" AND status = $13");
    }

    let mut query = sqlx::query(&sql)
        .bind(&experiment.id)
        .bind(&experiment.name)
        .bind(experiment.status)
        .bind(json_text(&experiment.parameters, "实验参数")?)
        .bind(&experiment.command_template)
        .bind(json_text(&experiment.requirements, "资源需求")?)
        .bind(json_text(&experiment.constraints, "实验约束")?)
        .bind(&experiment.owner_id)
        .bind(json_text(&experiment.metadata, "实验元数据")?)
        .bind(experiment.updated_at)
        .bind(experiment.started_at)
        .bind(experiment.completed_at);
    if let Some(status) = expected {
        query = query.bind(status);
    }

    let result = query
        .execute(executor)
        .await
        .map_err(SchedulerError::Database)?;
    Ok(result.rows_affected())
}

// ---- staging operations ----

pub(crate) fn staging_filter_query(filter: &StagingOperationFilter) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_STAGING_OPERATIONS);
    qb.push(" WHERE 1 = 1");
    if let Some(task_id) = &filter.task_id {
        qb.push(" AND task_id = ").push_bind(task_id.clone());
    }
    if !filter.statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY created_at ASC, rowid ASC");
    qb
}
