use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    models::{Schedule, Task, TaskOutcome, TaskStatus},
    traits::TaskStore,
    SchedulerError, SchedulerResult,
};
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use tracing::{debug, instrument, warn};

use crate::database::{TASK_COLUMNS, TASK_STATUS_EXPR};

/// PostgreSQL任务存储
///
/// 所有状态变更都是单条带条件的 `UPDATE`，以影响行数判断是否成功。
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &PgRow) -> SchedulerResult<Task> {
        let schedule = Schedule::from_parts(
            row.try_get("schedule_type")?,
            row.try_get("interval_minutes")?,
            row.try_get("cron_expression")?,
        )?;
        let parameters: Option<Json<Value>> = row.try_get("parameters")?;
        let result: Option<Json<Value>> = row.try_get("result")?;

        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            schedule,
            status: row.try_get("status")?,
            is_active: row.try_get("is_active")?,
            parameters: parameters.map(|json| json.0).unwrap_or(Value::Null),
            assigned_worker: row.try_get("assigned_worker")?,
            started_at: row.try_get("started_at")?,
            last_run_time: row.try_get("last_run_time")?,
            next_run_time: row.try_get("next_run_time")?,
            total_runs: row.try_get("total_runs")?,
            success_runs: row.try_get("success_runs")?,
            recovery_count: row.try_get("recovery_count")?,
            error_message: row.try_get("error_message")?,
            result: result.map(|json| json.0),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// 逐行解析，无法解析的行记录告警后跳过，不影响本轮其他任务
    fn rows_to_tasks(rows: &[PgRow]) -> Vec<Task> {
        rows.iter()
            .filter_map(|row| match Self::row_to_task(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    let id: Option<i64> = row.try_get("id").ok();
                    warn!(task_id = ?id, "跳过无法解析的任务记录: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_name = %task.name, kind = %task.kind))]
    async fn insert(&self, task: &Task) -> SchedulerResult<Task> {
        let sql = format!(
            r#"
            INSERT INTO tasks (name, kind, schedule_type, interval_minutes, cron_expression,
                status, is_active, parameters, assigned_worker, started_at, last_run_time,
                next_run_time, total_runs, success_runs, recovery_count, error_message, result,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&task.name)
            .bind(task.kind)
            .bind(task.schedule.schedule_type())
            .bind(task.schedule.interval_minutes())
            .bind(task.schedule.cron_expression())
            .bind(task.status)
            .bind(task.is_active)
            .bind(Json(&task.parameters))
            .bind(task.assigned_worker.as_deref())
            .bind(task.started_at)
            .bind(task.last_run_time)
            .bind(task.next_run_time)
            .bind(task.total_runs)
            .bind(task.success_runs)
            .bind(task.recovery_count)
            .bind(task.error_message.as_deref())
            .bind(task.result.as_ref().map(Json))
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::row_to_task(&row)?;
        debug!("创建任务成功: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn fetch_eligible(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE is_active = TRUE
              AND schedule_type <> 'manual'
              AND {TASK_STATUS_EXPR} IN ('PENDING', 'COMPLETED', 'FAILED')
              AND (next_run_time IS NULL OR next_run_time <= $1)
            ORDER BY next_run_time ASC NULLS FIRST, id ASC
            "#
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        Ok(Self::rows_to_tasks(&rows))
    }

    async fn fetch_running(&self) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE {TASK_STATUS_EXPR} = 'RUNNING' \
             ORDER BY last_run_time ASC NULLS FIRST, id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(Self::rows_to_tasks(&rows))
    }

    async fn fetch_stuck(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE {TASK_STATUS_EXPR} = 'RUNNING' \
             AND (last_run_time IS NULL OR last_run_time < $1) \
             ORDER BY last_run_time ASC NULLS FIRST, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now - threshold)
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::rows_to_tasks(&rows))
    }

    async fn arm_pending(
        &self,
        task_id: i64,
        allowed_from: &[TaskStatus],
    ) -> SchedulerResult<bool> {
        let allowed: Vec<String> = allowed_from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'PENDING', assigned_worker = NULL, updated_at = NOW()
            WHERE id = $1 AND {TASK_STATUS_EXPR} = ANY($2)
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(&allowed)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert_armed(
        &self,
        task_id: i64,
        previous_status: TaskStatus,
        previous_worker: Option<&str>,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = $2, assigned_worker = $3, updated_at = NOW()
            WHERE id = $1 AND {TASK_STATUS_EXPR} = 'PENDING' AND assigned_worker IS NULL
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(previous_status.as_str())
            .bind(previous_worker)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn advance_schedule(
        &self,
        task_id: i64,
        next_run_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()> {
        let result =
            sqlx::query("UPDATE tasks SET next_run_time = $2, updated_at = NOW() WHERE id = $1")
                .bind(task_id)
                .bind(next_run_time)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task_id });
        }
        Ok(())
    }

    #[instrument(skip(self, now))]
    async fn conditional_claim(
        &self,
        task_id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', assigned_worker = $2, started_at = $3,
                last_run_time = $3, updated_at = $3
            WHERE id = $1 AND {TASK_STATUS_EXPR} = 'PENDING'
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, outcome, now))]
    async fn update_terminal(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let (result_json, error_message) = match outcome {
            TaskOutcome::Completed { result } => (Some(Json(result)), None),
            TaskOutcome::Failed { error_message } => (None, Some(error_message.as_str())),
        };

        let sql = format!(
            r#"
            UPDATE tasks
            SET status = $3, result = $4, error_message = $5,
                total_runs = total_runs + 1, success_runs = success_runs + $6,
                updated_at = $7
            WHERE id = $1 AND {TASK_STATUS_EXPR} = 'RUNNING' AND assigned_worker = $2
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(worker_id)
            .bind(outcome.status())
            .bind(result_json)
            .bind(error_message)
            .bind(if outcome.is_success() { 1i64 } else { 0i64 })
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_to_pending(
        &self,
        task_id: i64,
        expected_worker: Option<&str>,
        reason: &str,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'PENDING', assigned_worker = NULL,
                recovery_count = recovery_count + 1, error_message = $3, updated_at = NOW()
            WHERE id = $1 AND {TASK_STATUS_EXPR} = 'RUNNING'
              AND assigned_worker IS NOT DISTINCT FROM $2
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(expected_worker)
            .bind(reason)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_stuck(
        &self,
        task_id: i64,
        expected_worker: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'FAILED', assigned_worker = NULL, error_message = $3,
                total_runs = total_runs + 1, updated_at = $4
            WHERE id = $1 AND {TASK_STATUS_EXPR} = 'RUNNING'
              AND assigned_worker IS NOT DISTINCT FROM $2
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(expected_worker)
            .bind(reason)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_pending(&self, task_id: i64, reason: &str) -> SchedulerResult<bool> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'CANCELLED', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND {TASK_STATUS_EXPR} = 'PENDING'
            "#
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
