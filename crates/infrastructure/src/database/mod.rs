pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::{InMemoryTaskStore, InMemoryWorkerStore};
pub use postgres::{PostgresTaskStore, PostgresWorkerStore};
pub use sqlite::{SqliteTaskStore, SqliteWorkerStore};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{
    config::DatabaseConfig,
    traits::{TaskStore, WorkerStore},
    SchedulerError, SchedulerResult,
};
use sqlx::sqlite::SqliteConnectOptions;
use tracing::info;

/// 任务列的统一查询顺序，各存储实现共用
pub(crate) const TASK_COLUMNS: &str = "id, name, kind, schedule_type, interval_minutes, \
     cron_expression, status, is_active, parameters, assigned_worker, started_at, \
     last_run_time, next_run_time, total_runs, success_runs, recovery_count, error_message, \
     result, created_at, updated_at";

pub(crate) const WORKER_COLUMNS: &str = "worker_id, host, port, max_concurrent_tasks, \
     current_tasks, capabilities, status, last_heartbeat, registered_at, \
     total_tasks_processed, successful_tasks, failed_tasks";

/// 规范化任务状态列的 SQL 表达式
///
/// 历史数据中的状态可能带有大小写差异或 `TaskStatus.` 前缀，所有按状态过滤的条件都基于该表达式。
pub(crate) const TASK_STATUS_EXPR: &str = "REPLACE(UPPER(TRIM(status)), 'TASKSTATUS.', '')";

pub(crate) const WORKER_STATUS_EXPR: &str = "REPLACE(UPPER(TRIM(status)), 'WORKERSTATUS.', '')";

/// Database type detection
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// Database connection pool
#[derive(Clone)]
pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    /// Create pool with automatic type detection
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);

        match DatabaseType::from_url(&config.url) {
            DatabaseType::PostgreSQL => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(&config.url)
                    .await?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                // 内存数据库每个连接各自独立，只能使用单连接且不能回收
                let in_memory = config.url.contains(":memory:");
                let connect_options = SqliteConnectOptions::from_str(&config.url)?
                    .create_if_missing(true);
                let mut options = sqlx::sqlite::SqlitePoolOptions::new()
                    .acquire_timeout(acquire_timeout);
                options = if in_memory {
                    options
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                } else {
                    options
                        .max_connections(config.max_connections)
                        .min_connections(config.min_connections)
                };
                let pool = options.connect_with(connect_options).await?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// 数据库管理器：负责连接池、迁移以及创建存储实现
pub struct DatabaseManager {
    pool: DatabasePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let pool = DatabasePool::connect(config).await?;
        info!("数据库连接成功: {:?}", pool.database_type());
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    /// 运行数据库迁移
    pub async fn migrate(&self) -> SchedulerResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::migrate!("../../migrations")
                    .run(pool)
                    .await
                    .map_err(|e| SchedulerError::DatabaseOperation(format!("数据库迁移失败: {e}")))?;
            }
            DatabasePool::SQLite(pool) => sqlite::schema::apply(pool).await?,
        }
        info!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DatabasePool::SQLite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }

    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresTaskStore::new(pool.clone())),
            DatabasePool::SQLite(pool) => Arc::new(SqliteTaskStore::new(pool.clone())),
        }
    }

    pub fn worker_store(&self) -> Arc<dyn WorkerStore> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresWorkerStore::new(pool.clone())),
            DatabasePool::SQLite(pool) => Arc::new(SqliteWorkerStore::new(pool.clone())),
        }
    }
}
