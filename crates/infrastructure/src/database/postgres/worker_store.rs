use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{
    models::{HeartbeatAck, TaskKind, Worker, WorkerStatus},
    traits::WorkerStore,
    SchedulerError, SchedulerResult,
};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use tracing::{debug, warn};

use crate::database::{WORKER_COLUMNS, WORKER_STATUS_EXPR};

/// PostgreSQL Worker注册信息存储
pub struct PostgresWorkerStore {
    pool: PgPool,
}

impl PostgresWorkerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &PgRow) -> SchedulerResult<Worker> {
        let port: i32 = row.try_get("port")?;
        let capabilities: Json<Vec<TaskKind>> = row.try_get("capabilities")?;

        Ok(Worker {
            worker_id: row.try_get("worker_id")?,
            host: row.try_get("host")?,
            port: u16::try_from(port)
                .map_err(|_| SchedulerError::DatabaseOperation(format!("无效的端口号: {port}")))?,
            max_concurrent_tasks: row.try_get("max_concurrent_tasks")?,
            current_tasks: row.try_get("current_tasks")?,
            capabilities: capabilities.0,
            status: row.try_get("status")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            registered_at: row.try_get("registered_at")?,
            total_tasks_processed: row.try_get("total_tasks_processed")?,
            successful_tasks: row.try_get("successful_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
        })
    }

    fn rows_to_workers(rows: &[PgRow]) -> Vec<Worker> {
        rows.iter()
            .filter_map(|row| match Self::row_to_worker(row) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!("跳过无法解析的Worker记录: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl WorkerStore for PostgresWorkerStore {
    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, host, port, max_concurrent_tasks, current_tasks,
                capabilities, status, last_heartbeat, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (worker_id) DO UPDATE SET
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                max_concurrent_tasks = EXCLUDED.max_concurrent_tasks,
                current_tasks = EXCLUDED.current_tasks,
                capabilities = EXCLUDED.capabilities,
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.host)
        .bind(worker.port as i32)
        .bind(worker.max_concurrent_tasks)
        .bind(worker.current_tasks)
        .bind(Json(&worker.capabilities))
        .bind(worker.status)
        .bind(worker.last_heartbeat)
        .bind(worker.registered_at)
        .execute(&self.pool)
        .await?;

        debug!("注册Worker成功: {}", worker.worker_id);
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        worker_id: &str,
        current_tasks: i32,
        status: WorkerStatus,
        at: DateTime<Utc>,
    ) -> SchedulerResult<HeartbeatAck> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET current_tasks = $2, status = $3, last_heartbeat = $4
            WHERE worker_id = $1 AND last_heartbeat <= $4 AND $2 >= 0 AND $2 <= max_concurrent_tasks
            "#,
        )
        .bind(worker_id)
        .bind(current_tasks)
        .bind(status)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(HeartbeatAck::Accepted);
        }

        Ok(match self.get_worker(worker_id).await? {
            None => HeartbeatAck::UnknownWorker,
            Some(_) if current_tasks < 0 => {
                HeartbeatAck::Rejected(format!("当前任务数不能为负: {current_tasks}"))
            }
            Some(worker) if current_tasks > worker.max_concurrent_tasks => HeartbeatAck::Rejected(
                format!(
                    "当前任务数 {} 超过最大并发数 {}",
                    current_tasks, worker.max_concurrent_tasks
                ),
            ),
            Some(_) => HeartbeatAck::Stale,
        })
    }

    async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = $1");
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at, worker_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(Self::rows_to_workers(&rows))
    }

    async fn list_online_workers(&self) -> SchedulerResult<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers \
             WHERE {WORKER_STATUS_EXPR} IN ('ONLINE', 'BUSY', 'MAINTENANCE') \
             ORDER BY registered_at, worker_id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(Self::rows_to_workers(&rows))
    }

    async fn mark_offline(
        &self,
        worker_id: &str,
        observed_heartbeat: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE workers SET status = 'OFFLINE'
            WHERE worker_id = $1 AND last_heartbeat = $2
              AND {WORKER_STATUS_EXPR} IN ('ONLINE', 'BUSY', 'MAINTENANCE')
            "#
        );
        let result = sqlx::query(&sql)
            .bind(worker_id)
            .bind(observed_heartbeat)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_task_outcome(&self, worker_id: &str, success: bool) -> SchedulerResult<()> {
        let (succeeded, failed) = if success { (1i64, 0i64) } else { (0, 1) };
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET total_tasks_processed = total_tasks_processed + 1,
                successful_tasks = successful_tasks + $2,
                failed_tasks = failed_tasks + $3
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .bind(succeeded)
        .bind(failed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET status = 'OFFLINE', current_tasks = 0 WHERE worker_id = $1",
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        debug!("注销Worker: {}", worker_id);
        Ok(result.rows_affected() == 1)
    }
}
