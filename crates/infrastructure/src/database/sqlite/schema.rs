use scheduler_core::SchedulerResult;
use sqlx::SqlitePool;

/// SQLite 表结构，时间列为 UTC 毫秒
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('diagnosis', 'event', 'maintenance')),
    schedule_type TEXT NOT NULL,
    interval_minutes INTEGER,
    cron_expression TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    is_active INTEGER NOT NULL DEFAULT 1,
    parameters TEXT NOT NULL DEFAULT 'null',
    assigned_worker TEXT,
    started_at INTEGER,
    last_run_time INTEGER,
    next_run_time INTEGER,
    total_runs INTEGER NOT NULL DEFAULT 0,
    success_runs INTEGER NOT NULL DEFAULT 0,
    recovery_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    result TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_next_run_time ON tasks (next_run_time);

CREATE TABLE IF NOT EXISTS workers (
    worker_id TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    max_concurrent_tasks INTEGER NOT NULL CHECK (max_concurrent_tasks > 0),
    current_tasks INTEGER NOT NULL DEFAULT 0,
    capabilities TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'ONLINE',
    last_heartbeat INTEGER NOT NULL,
    registered_at INTEGER NOT NULL,
    total_tasks_processed INTEGER NOT NULL DEFAULT 0,
    successful_tasks INTEGER NOT NULL DEFAULT 0,
    failed_tasks INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_workers_status ON workers (status);
"#;

/// 创建表结构，可重复执行
pub async fn apply(pool: &SqlitePool) -> SchedulerResult<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
