use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::SqlitePool;
use tracing::debug;

const SCHEMA: &[(&str, &str)] = &[
    (
        "experiments",
        r#"
        CREATE TABLE IF NOT EXISTS experiments (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'CREATED',
            parameters TEXT NOT NULL DEFAULT '[]',
            command_template TEXT NOT NULL,
            requirements TEXT NOT NULL DEFAULT '{}',
            constraints TEXT NOT NULL DEFAULT '{}',
            owner_id TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            started_at DATETIME,
            completed_at DATETIME
        )
        "#,
    ),
    (
        "compute_resources",
        r#"
        CREATE TABLE IF NOT EXISTS compute_resources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            max_workers INTEGER NOT NULL DEFAULT 0,
            current_workers INTEGER NOT NULL DEFAULT 0,
            cost_per_hour REAL NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "tasks",
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            experiment_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'CREATED',
            command TEXT NOT NULL,
            execution_script TEXT,
            worker_id TEXT,
            compute_resource_id TEXT,
            input_files TEXT NOT NULL DEFAULT '[]',
            output_files TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            error TEXT,
            result_summary TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            started_at DATETIME,
            completed_at DATETIME,
            duration_ms INTEGER
        )
        "#,
    ),
    (
        "workers",
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            compute_resource_id TEXT NOT NULL,
            experiment_id TEXT NOT NULL,
            user_id TEXT,
            status TEXT NOT NULL DEFAULT 'IDLE',
            current_task_id TEXT,
            walltime_seconds INTEGER NOT NULL,
            walltime_remaining_seconds INTEGER NOT NULL,
            last_heartbeat DATETIME NOT NULL,
            registered_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            terminated_at DATETIME,
            metadata TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    ),
    (
        "staging_operations",
        r#"
        CREATE TABLE IF NOT EXISTS staging_operations (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            compute_resource_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            source_path TEXT NOT NULL DEFAULT '',
            destination_path TEXT NOT NULL DEFAULT '',
            total_size INTEGER,
            transferred_size INTEGER NOT NULL DEFAULT 0,
            transfer_rate REAL,
            error_message TEXT,
            timeout_seconds INTEGER NOT NULL DEFAULT 600,
            started_at DATETIME,
            completed_at DATETIME,
            transfer_finished_at DATETIME,
            last_heartbeat DATETIME NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "worker_metrics",
        r#"
        CREATE TABLE IF NOT EXISTS worker_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id TEXT NOT NULL,
            cpu_usage_percent REAL NOT NULL,
            memory_usage_percent REAL NOT NULL,
            tasks_completed INTEGER NOT NULL DEFAULT 0,
            tasks_failed INTEGER NOT NULL DEFAULT 0,
            average_task_duration_ms INTEGER NOT NULL DEFAULT 0,
            recorded_at DATETIME NOT NULL
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tasks_experiment_status ON tasks(experiment_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_resource ON tasks(compute_resource_id)",
    "CREATE INDEX IF NOT EXISTS idx_workers_experiment ON workers(experiment_id)",
    "CREATE INDEX IF NOT EXISTS idx_staging_task ON staging_operations(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_staging_status ON staging_operations(status)",
    "CREATE INDEX IF NOT EXISTS idx_worker_metrics_worker ON worker_metrics(worker_id, recorded_at)",
];

/// 建表与索引，可重复执行
pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
    debug!("执行SQLite数据库迁移");

    for (table, ddl) in SCHEMA {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| SchedulerError::database_error(format!("创建表 {table} 失败: {e}")))?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(SchedulerError::Database)?;
    }

    debug!("SQLite数据库迁移完成");
    Ok(())
}
