use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{
    models::{HeartbeatAck, TaskKind, Worker, WorkerStatus},
    traits::WorkerStore,
    SchedulerError, SchedulerResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, warn};

use super::{from_millis, to_millis};
use crate::database::{WORKER_COLUMNS, WORKER_STATUS_EXPR};

/// SQLite Worker注册信息存储
pub struct SqliteWorkerStore {
    pool: SqlitePool,
}

impl SqliteWorkerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &SqliteRow) -> SchedulerResult<Worker> {
        let port: i64 = row.try_get("port")?;
        let capabilities: String = row.try_get("capabilities")?;
        let capabilities: Vec<TaskKind> = serde_json::from_str(&capabilities)?;

        Ok(Worker {
            worker_id: row.try_get("worker_id")?,
            host: row.try_get("host")?,
            port: u16::try_from(port)
                .map_err(|_| SchedulerError::DatabaseOperation(format!("无效的端口号: {port}")))?,
            max_concurrent_tasks: row.try_get("max_concurrent_tasks")?,
            current_tasks: row.try_get("current_tasks")?,
            capabilities,
            status: row.try_get("status")?,
            last_heartbeat: from_millis(row.try_get("last_heartbeat")?)?,
            registered_at: from_millis(row.try_get("registered_at")?)?,
            total_tasks_processed: row.try_get("total_tasks_processed")?,
            successful_tasks: row.try_get("successful_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
        })
    }

    fn rows_to_workers(rows: &[SqliteRow]) -> Vec<Worker> {
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
impl WorkerStore for SqliteWorkerStore {
    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, host, port, max_concurrent_tasks, current_tasks,
                capabilities, status, last_heartbeat, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (worker_id) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                current_tasks = excluded.current_tasks,
                capabilities = excluded.capabilities,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.host)
        .bind(i64::from(worker.port))
        .bind(worker.max_concurrent_tasks)
        .bind(worker.current_tasks)
        .bind(serde_json::to_string(&worker.capabilities)?)
        .bind(worker.status)
        .bind(to_millis(worker.last_heartbeat))
        .bind(to_millis(worker.registered_at))
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
            SET current_tasks = ?1, status = ?2, last_heartbeat = ?3
            WHERE worker_id = ?4 AND last_heartbeat <= ?3 AND ?1 >= 0 AND ?1 <= max_concurrent_tasks
            "#,
        )
        .bind(current_tasks)
        .bind(status)
        .bind(to_millis(at))
        .bind(worker_id)
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
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?");
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
            "UPDATE workers SET status = 'OFFLINE' \
             WHERE worker_id = ? AND last_heartbeat = ? \
             AND {WORKER_STATUS_EXPR} IN ('ONLINE', 'BUSY', 'MAINTENANCE')"
        );
        let result = sqlx::query(&sql)
            .bind(worker_id)
            .bind(to_millis(observed_heartbeat))
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
                successful_tasks = successful_tasks + ?,
                failed_tasks = failed_tasks + ?
            WHERE worker_id = ?
            "#,
        )
        .bind(succeeded)
        .bind(failed)
        .bind(worker_id)
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
        let result =
            sqlx::query("UPDATE workers SET status = 'OFFLINE', current_tasks = 0 WHERE worker_id = ?")
                .bind(worker_id)
                .execute(&self.pool)
                .await?;

        debug!("注销Worker: {}", worker_id);
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use scheduler_core::models::WorkerRegistration;

    async fn store() -> SqliteWorkerStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        super::super::schema::apply(&pool).await.unwrap();
        SqliteWorkerStore::new(pool)
    }

    fn worker(id: &str, now: DateTime<Utc>) -> Worker {
        Worker::new(
            WorkerRegistration {
                worker_id: id.to_string(),
                host: "127.0.0.1".to_string(),
                port: 9001,
                max_concurrent_tasks: 2,
                capabilities: vec![TaskKind::Diagnosis, TaskKind::Event],
            },
            now,
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_worker(&worker("w1", now)).await.unwrap();

        let loaded = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(loaded.port, 9001);
        assert_eq!(loaded.capabilities, vec![TaskKind::Diagnosis, TaskKind::Event]);
        assert_eq!(loaded.status, WorkerStatus::Online);
        assert_eq!(to_millis(loaded.last_heartbeat), to_millis(now));

        // 重复注册覆盖而不是新增
        let mut again = worker("w1", now);
        again.max_concurrent_tasks = 5;
        store.upsert_worker(&again).await.unwrap();
        let all = store.list_workers().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].max_concurrent_tasks, 5);
    }

    #[tokio::test]
    async fn test_heartbeat_outcomes() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_worker(&worker("w1", now)).await.unwrap();

        let later = now + Duration::seconds(30);
        assert_eq!(
            store
                .record_heartbeat("w1", 1, WorkerStatus::Online, later)
                .await
                .unwrap(),
            HeartbeatAck::Accepted
        );
        assert_eq!(
            store
                .record_heartbeat("w1", 0, WorkerStatus::Online, now)
                .await
                .unwrap(),
            HeartbeatAck::Stale
        );
        assert!(matches!(
            store
                .record_heartbeat("w1", 3, WorkerStatus::Busy, later + Duration::seconds(30))
                .await
                .unwrap(),
            HeartbeatAck::Rejected(_)
        ));
        assert!(matches!(
            store
                .record_heartbeat("w1", -1, WorkerStatus::Online, later + Duration::seconds(60))
                .await
                .unwrap(),
            HeartbeatAck::Rejected(_)
        ));
        assert_eq!(
            store
                .record_heartbeat("ghost", 0, WorkerStatus::Online, later)
                .await
                .unwrap(),
            HeartbeatAck::UnknownWorker
        );

        let loaded = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(loaded.current_tasks, 1);
        assert_eq!(to_millis(loaded.last_heartbeat), to_millis(later));
    }

    #[tokio::test]
    async fn test_mark_offline_is_conditional_on_observed_heartbeat() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_worker(&worker("w1", now)).await.unwrap();
        store
            .record_heartbeat("w1", 0, WorkerStatus::Online, now + Duration::seconds(10))
            .await
            .unwrap();

        // 扫描时看到的是旧心跳，期间Worker又上报过，不能下线
        assert!(!store.mark_offline("w1", now).await.unwrap());
        assert!(store
            .mark_offline("w1", now + Duration::seconds(10))
            .await
            .unwrap());
        assert!(store.list_online_workers().await.unwrap().is_empty());
        assert_eq!(store.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_worker_status_is_online() {
        let store = store().await;
        store.upsert_worker(&worker("w1", Utc::now())).await.unwrap();
        sqlx::query("UPDATE workers SET status = 'WorkerStatus.BUSY'")
            .execute(&store.pool)
            .await
            .unwrap();

        let online = store.list_online_workers().await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn test_outcome_counters_and_deregister() {
        let store = store().await;
        store.upsert_worker(&worker("w1", Utc::now())).await.unwrap();
        store.record_task_outcome("w1", true).await.unwrap();
        store.record_task_outcome("w1", false).await.unwrap();
        assert!(matches!(
            store.record_task_outcome("ghost", true).await,
            Err(SchedulerError::WorkerNotFound { .. })
        ));

        let loaded = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(loaded.total_tasks_processed, 2);
        assert_eq!(loaded.successful_tasks, 1);
        assert_eq!(loaded.failed_tasks, 1);

        assert!(store.deregister("w1").await.unwrap());
        let loaded = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkerStatus::Offline);
        assert!(!store.deregister("ghost").await.unwrap());
    }
}
