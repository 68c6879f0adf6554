use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::{
    models::{Task, TaskOutcome, TaskStatus},
    SchedulerResult,
};

/// 任务存储抽象接口
///
/// 任务状态的唯一权威来源。所有状态变更都是带条件的单条写入，
/// 返回 `false` 表示条件不满足（被其他参与方抢先），而不是错误。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 新建任务，返回带有生成 id 的任务
    async fn insert(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get(&self, task_id: i64) -> SchedulerResult<Option<Task>>;

    /// 启用的、非手动的、处于可重新入队状态且 `next_run_time` 已到（或未设置）的任务
    async fn fetch_eligible(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>>;

    /// 所有 RUNNING 状态的任务
    async fn fetch_running(&self) -> SchedulerResult<Vec<Task>>;

    /// RUNNING 且 `last_run_time` 早于 `now - threshold` 的任务
    async fn fetch_stuck(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>>;

    /// 当前状态属于 `allowed_from` 时置为 PENDING 并清空 `assigned_worker`
    async fn arm_pending(&self, task_id: i64, allowed_from: &[TaskStatus])
        -> SchedulerResult<bool>;

    /// 发布失败时撤销 `arm_pending`
    ///
    /// 仅当任务仍为 PENDING 且未被认领时恢复原状态与原Worker。
    async fn revert_armed(
        &self,
        task_id: i64,
        previous_status: TaskStatus,
        previous_worker: Option<&str>,
    ) -> SchedulerResult<bool>;

    /// 入队成功后推进下次执行时间
    async fn advance_schedule(
        &self,
        task_id: i64,
        next_run_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()>;

    /// 仅当状态为 PENDING 时原子地置为 RUNNING 并绑定 Worker
    async fn conditional_claim(
        &self,
        task_id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 仅当任务仍由 `worker_id` 以 RUNNING 持有时写入终态
    async fn update_terminal(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 回收卡死任务：仍为 RUNNING 且持有者未变时重置为 PENDING
    async fn reset_to_pending(
        &self,
        task_id: i64,
        expected_worker: Option<&str>,
        reason: &str,
    ) -> SchedulerResult<bool>;

    /// 回收次数用尽的卡死任务直接置为 FAILED
    async fn fail_stuck(
        &self,
        task_id: i64,
        expected_worker: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 仅当状态为 PENDING 时置为 CANCELLED
    async fn cancel_pending(&self, task_id: i64, reason: &str) -> SchedulerResult<bool>;
}
