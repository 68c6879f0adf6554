use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{HeartbeatAck, Worker, WorkerStatus},
    SchedulerResult,
};

/// Worker注册信息存储
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// 插入或更新Worker，已有记录保留注册时间和统计计数
    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()>;

    /// 记录心跳；时间戳早于已记录值的心跳被忽略（返回 `Stale`）
    async fn record_heartbeat(
        &self,
        worker_id: &str,
        current_tasks: i32,
        status: WorkerStatus,
        at: DateTime<Utc>,
    ) -> SchedulerResult<HeartbeatAck>;

    async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<Worker>>;

    async fn list_workers(&self) -> SchedulerResult<Vec<Worker>>;

    /// 状态为存活（ONLINE/BUSY/MAINTENANCE）的Worker
    async fn list_online_workers(&self) -> SchedulerResult<Vec<Worker>>;

    /// 心跳仍为 `observed_heartbeat` 时置为 OFFLINE，避免覆盖并发到达的新心跳
    async fn mark_offline(
        &self,
        worker_id: &str,
        observed_heartbeat: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn record_task_outcome(&self, worker_id: &str, success: bool) -> SchedulerResult<()>;

    /// 注销：置为 OFFLINE 并清零当前任务数
    async fn deregister(&self, worker_id: &str) -> SchedulerResult<bool>;
}
