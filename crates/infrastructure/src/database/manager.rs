use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::DatabaseConfig;
use scheduler_domain::Repository;
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::memory::InMemoryRepository;
use super::sqlite::{run_migrations, SqliteRepository};

/// Database type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    SQLite,
    Memory,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("memory://") {
            DatabaseType::Memory
        } else {
            DatabaseType::SQLite
        }
    }
}

enum Backend {
    SQLite(SqlitePool),
    Memory(InMemoryRepository),
}

/// 统一的数据库管理器：建立连接、执行迁移并提供仓储
pub struct DatabaseManager {
    backend: Backend,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let backend = match DatabaseType::from_url(&config.url) {
            DatabaseType::Memory => {
                info!("使用内存存储");
                Backend::Memory(InMemoryRepository::new())
            }
            DatabaseType::SQLite => {
                let connect_options = SqliteConnectOptions::from_str(&config.url)
                    .map_err(SchedulerError::Database)?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                    .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
                    .connect_with(connect_options)
                    .await
                    .map_err(SchedulerError::Database)?;

                info!("已连接SQLite数据库: {}", config.url);
                Backend::SQLite(pool)
            }
        };

        Ok(Self { backend })
    }

    pub fn database_type(&self) -> DatabaseType {
        match self.backend {
            Backend::SQLite(_) => DatabaseType::SQLite,
            Backend::Memory(_) => DatabaseType::Memory,
        }
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        match &self.backend {
            Backend::SQLite(pool) => run_migrations(pool).await,
            Backend::Memory(_) => Ok(()),
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        self.repository().ping().await
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        match &self.backend {
            Backend::SQLite(pool) => Arc::new(SqliteRepository::new(pool.clone())),
            Backend::Memory(repo) => Arc::new(repo.clone()),
        }
    }

    pub async fn close(&self) {
        if let Backend::SQLite(pool) = &self.backend {
            pool.close().await;
        }
    }
}
