//! 进程内存储实现
//!
//! 用于单进程部署和测试。每个操作在同一把写锁内完成“检查条件 + 修改”，
//! 与数据库实现的单条条件 `UPDATE` 语义一致。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    models::{HeartbeatAck, Task, TaskOutcome, TaskStatus, Worker, WorkerStatus},
    traits::{TaskStore, WorkerStore},
    SchedulerError, SchedulerResult,
};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct TaskTable {
    next_id: i64,
    tasks: HashMap<i64, Task>,
}

/// 内存任务存储
#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<TaskTable>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入一条任务（保留其 id），用于构造测试场景
    pub async fn put(&self, task: Task) {
        let mut table = self.inner.write().await;
        table.next_id = table.next_id.max(task.id);
        table.tasks.insert(task.id, task);
    }

    pub async fn all(&self) -> Vec<Task> {
        let table = self.inner.read().await;
        let mut tasks: Vec<Task> = table.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

fn sort_by_time(tasks: &mut [Task], key: fn(&Task) -> Option<DateTime<Utc>>) {
    // 未设置时间的排在最前
    tasks.sort_by(|a, b| key(a).cmp(&key(b)).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> SchedulerResult<Task> {
        let mut table = self.inner.write().await;
        table.next_id += 1;
        let mut created = task.clone();
        created.id = table.next_id;
        table.tasks.insert(created.id, created.clone());
        debug!("创建任务成功: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn fetch_eligible(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let table = self.inner.read().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| {
                t.is_active
                    && !t.is_manual()
                    && t.status.is_rearmable()
                    && t.next_run_time.map_or(true, |next| next <= now)
            })
            .cloned()
            .collect();
        sort_by_time(&mut tasks, |t| t.next_run_time);
        Ok(tasks)
    }

    async fn fetch_running(&self) -> SchedulerResult<Vec<Task>> {
        let table = self.inner.read().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect();
        sort_by_time(&mut tasks, |t| t.last_run_time);
        Ok(tasks)
    }

    async fn fetch_stuck(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let cutoff = now - threshold;
        let table = self.inner.read().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running && t.last_run_time.map_or(true, |at| at < cutoff)
            })
            .cloned()
            .collect();
        sort_by_time(&mut tasks, |t| t.last_run_time);
        Ok(tasks)
    }

    async fn arm_pending(
        &self,
        task_id: i64,
        allowed_from: &[TaskStatus],
    ) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task) if allowed_from.contains(&task.status) => {
                task.status = TaskStatus::Pending;
                task.assigned_worker = None;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_armed(
        &self,
        task_id: i64,
        previous_status: TaskStatus,
        previous_worker: Option<&str>,
    ) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Pending && task.assigned_worker.is_none() => {
                task.status = previous_status;
                task.assigned_worker = previous_worker.map(str::to_string);
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_schedule(
        &self,
        task_id: i64,
        next_run_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        task.next_run_time = next_run_time;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn conditional_claim(
        &self,
        task_id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.assigned_worker = Some(worker_id.to_string());
                task.started_at = Some(now);
                task.last_run_time = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_terminal(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.assigned_worker.as_deref() == Some(worker_id) =>
            {
                task.status = outcome.status();
                match outcome {
                    TaskOutcome::Completed { result } => {
                        task.result = Some(result.clone());
                        task.error_message = None;
                        task.success_runs += 1;
                    }
                    TaskOutcome::Failed { error_message } => {
                        task.result = None;
                        task.error_message = Some(error_message.clone());
                    }
                }
                task.total_runs += 1;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_to_pending(
        &self,
        task_id: i64,
        expected_worker: Option<&str>,
        reason: &str,
    ) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.assigned_worker.as_deref() == expected_worker =>
            {
                task.status = TaskStatus::Pending;
                task.assigned_worker = None;
                task.recovery_count += 1;
                task.error_message = Some(reason.to_string());
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_stuck(
        &self,
        task_id: i64,
        expected_worker: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.assigned_worker.as_deref() == expected_worker =>
            {
                task.status = TaskStatus::Failed;
                task.assigned_worker = None;
                task.error_message = Some(reason.to_string());
                task.total_runs += 1;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_pending(&self, task_id: i64, reason: &str) -> SchedulerResult<bool> {
        let mut table = self.inner.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.error_message = Some(reason.to_string());
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// 内存Worker存储
#[derive(Default)]
pub struct InMemoryWorkerStore {
    workers: RwLock<HashMap<String, Worker>>,
}

impl InMemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut workers: Vec<Worker>) -> Vec<Worker> {
        workers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        workers
    }
}

#[async_trait]
impl WorkerStore for InMemoryWorkerStore {
    async fn upsert_worker(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(&worker.worker_id) {
            // 重新注册保留累计计数与首次注册时间
            Some(existing) => {
                existing.host = worker.host.clone();
                existing.port = worker.port;
                existing.max_concurrent_tasks = worker.max_concurrent_tasks;
                existing.current_tasks = worker.current_tasks;
                existing.capabilities = worker.capabilities.clone();
                existing.status = worker.status;
                existing.last_heartbeat = worker.last_heartbeat;
            }
            None => {
                workers.insert(worker.worker_id.clone(), worker.clone());
            }
        }
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
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            return Ok(HeartbeatAck::UnknownWorker);
        };

        if current_tasks < 0 {
            return Ok(HeartbeatAck::Rejected(format!(
                "当前任务数不能为负: {current_tasks}"
            )));
        }

        if current_tasks > worker.max_concurrent_tasks {
            return Ok(HeartbeatAck::Rejected(format!(
                "当前任务数 {} 超过最大并发数 {}",
                current_tasks, worker.max_concurrent_tasks
            )));
        }

        if at < worker.last_heartbeat {
            return Ok(HeartbeatAck::Stale);
        }

        worker.current_tasks = current_tasks;
        worker.status = status;
        worker.last_heartbeat = at;
        Ok(HeartbeatAck::Accepted)
    }

    async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.workers.read().await.get(worker_id).cloned())
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        let workers = self.workers.read().await;
        Ok(Self::sorted(workers.values().cloned().collect()))
    }

    async fn list_online_workers(&self) -> SchedulerResult<Vec<Worker>> {
        let workers = self.workers.read().await;
        Ok(Self::sorted(
            workers
                .values()
                .filter(|w| w.status.is_live())
                .cloned()
                .collect(),
        ))
    }

    async fn mark_offline(
        &self,
        worker_id: &str,
        observed_heartbeat: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(worker)
                if worker.status.is_live() && worker.last_heartbeat == observed_heartbeat =>
            {
                worker.status = WorkerStatus::Offline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_task_outcome(&self, worker_id: &str, success: bool) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.total_tasks_processed += 1;
        if success {
            worker.successful_tasks += 1;
        } else {
            worker.failed_tasks += 1;
        }
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> SchedulerResult<bool> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.status = WorkerStatus::Offline;
                worker.current_tasks = 0;
                debug!("注销Worker: {}", worker_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
