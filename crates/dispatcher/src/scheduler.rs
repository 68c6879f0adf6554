use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use scheduler_core::{
    config::{BrokerConfig, DispatcherConfig},
    models::{Priority, Schedule, Task, TaskMessage, TaskStatus},
    traits::{MessageBroker, QueueInfo, TaskStore, TimeProvider},
    SchedulerError, SchedulerResult,
};
use scheduler_infrastructure::broker::declare_task_queues;

use crate::registry::{DispatchDecision, WorkerRegistry};
use crate::schedule::{calculate_priority, evaluate_schedule, next_run_after};

/// 周期调度可以重新入队的状态
const REARMABLE: [TaskStatus; 3] = [TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Failed];

/// 手动触发额外允许从已取消状态恢复
const TRIGGERABLE: [TaskStatus; 4] = [
    TaskStatus::Pending,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Cancelled,
];

/// 一次入队扫描的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued,
    AlreadyRunning,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    Refused(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// 任务已在执行，只能由执行方在安全点协作式地响应
    RunningBestEffort,
    NotCancellable,
}

/// 队列连接与深度
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub connected: bool,
    pub queues: Vec<QueueInfo>,
}

/// 任务调度器
///
/// 只负责把到期任务置为 PENDING 并发布消息，从不写 RUNNING 或终态。
pub struct TaskScheduler {
    task_store: Arc<dyn TaskStore>,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<WorkerRegistry>,
    broker_config: BrokerConfig,
    config: DispatcherConfig,
    clock: Arc<dyn TimeProvider>,
}

impl TaskScheduler {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        broker: Arc<dyn MessageBroker>,
        registry: Arc<WorkerRegistry>,
        broker_config: BrokerConfig,
        config: DispatcherConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            task_store,
            broker,
            registry,
            broker_config,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::seconds(self.config.stuck_threshold_seconds)
    }

    pub async fn declare_queues(&self) -> SchedulerResult<()> {
        declare_task_queues(self.broker.as_ref(), &self.broker_config).await
    }

    /// 扫描到期任务并入队
    ///
    /// 只有发布确认之后才推进下次执行时间；发布失败的任务保持原调度，下一轮重试。
    pub async fn enqueue_eligible_tasks(&self) -> SchedulerResult<EnqueueReport> {
        let now = self.clock.now();
        let candidates = self.task_store.fetch_eligible(now).await?;
        let mut report = EnqueueReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for task in candidates {
            if !evaluate_schedule(&task, now) {
                report.skipped += 1;
                continue;
            }

            match self.enqueue_task(&task, now).await {
                Ok(true) => report.enqueued += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("任务 {} ({}) 入队失败，下一轮重试: {}", task.id, task.name, e);
                }
            }
        }

        if report.enqueued > 0 || report.failed > 0 {
            info!(
                "入队扫描完成: 扫描 {}，入队 {}，跳过 {}，失败 {}",
                report.scanned, report.enqueued, report.skipped, report.failed
            );
        } else {
            debug!("入队扫描完成: 扫描 {}，无任务入队", report.scanned);
        }

        Ok(report)
    }

    async fn enqueue_task(&self, task: &Task, now: DateTime<Utc>) -> SchedulerResult<bool> {
        if !self.task_store.arm_pending(task.id, &REARMABLE).await? {
            debug!("任务 {} 状态已变化，跳过本次入队", task.id);
            return Ok(false);
        }

        let priority = calculate_priority(task, now);
        let queue = self.broker_config.queue_for(task.kind);
        if let Err(e) = self.publish(task, queue, priority, now, None).await {
            self.revert_armed(task).await;
            return Err(e);
        }

        let next_run_time = match &task.schedule {
            // 单次任务以卡死阈值作为重复发布的保护窗口
            Schedule::Once => Some(now + self.stuck_threshold()),
            schedule => next_run_after(schedule, now),
        };
        self.task_store
            .advance_schedule(task.id, next_run_time)
            .await?;

        info!(
            "任务 {} ({}) 已发布到队列 {}，优先级 {}，下次执行 {:?}",
            task.id, task.name, queue, priority, next_run_time
        );
        Ok(true)
    }

    /// 发布失败后把任务恢复到置为 PENDING 之前的状态
    async fn revert_armed(&self, task: &Task) {
        match self
            .task_store
            .revert_armed(task.id, task.status, task.assigned_worker.as_deref())
            .await
        {
            Ok(true) => debug!("任务 {} 发布失败，已恢复为 {}", task.id, task.status),
            Ok(false) => debug!("任务 {} 状态已被其他方修改，不再恢复", task.id),
            Err(e) => warn!("恢复任务 {} 的状态失败: {}", task.id, e),
        }
    }

    async fn publish(
        &self,
        task: &Task,
        queue: &str,
        priority: u8,
        now: DateTime<Utc>,
        target_worker: Option<&str>,
    ) -> SchedulerResult<()> {
        let attempt = u32::try_from(task.recovery_count).unwrap_or(0) + 1;
        let mut message = TaskMessage::new(task.id, task.kind, now)
            .with_priority(priority)
            .with_attempt(attempt);
        if let Some(worker_id) = target_worker {
            message = message.targeted(worker_id);
        }
        self.broker.publish(queue, &message, true).await
    }

    /// 立即触发任务，也是失败任务的手动重试入口
    pub async fn trigger_now(&self, task_id: i64) -> SchedulerResult<TriggerOutcome> {
        let task = self
            .task_store
            .get(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        if !task.is_active {
            info!("任务 {} 未启用，忽略手动触发", task_id);
            return Ok(TriggerOutcome::Inactive);
        }

        if task.status == TaskStatus::Running
            || !self.task_store.arm_pending(task_id, &TRIGGERABLE).await?
        {
            info!("任务 {} 正在执行，忽略手动触发", task_id);
            return Ok(TriggerOutcome::AlreadyRunning);
        }

        let now = self.clock.now();
        let queue = self.broker_config.queue_for(task.kind);
        if let Err(e) = self
            .publish(&task, queue, Priority::MANUAL_TRIGGER, now, None)
            .await
        {
            self.revert_armed(&task).await;
            return Err(e);
        }

        info!("任务 {} ({}) 已手动触发，发布到队列 {}", task.id, task.name, queue);
        Ok(TriggerOutcome::Enqueued)
    }

    /// 定向派发到指定Worker的专属队列
    pub async fn dispatch_to_worker(
        &self,
        task_id: i64,
        worker_id: &str,
    ) -> SchedulerResult<DispatchOutcome> {
        let task = self
            .task_store
            .get(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        if !task.is_active {
            return Ok(DispatchOutcome::Refused(format!("任务 {task_id} 未启用")));
        }

        if task.status == TaskStatus::Running {
            return Ok(DispatchOutcome::Refused(format!("任务 {task_id} 正在执行")));
        }

        if let DispatchDecision::Refused(reason) =
            self.registry.check_dispatch(worker_id, task.kind).await?
        {
            warn!("拒绝将任务 {} 派发到Worker {}: {}", task_id, worker_id, reason);
            return Ok(DispatchOutcome::Refused(reason));
        }

        if !self.task_store.arm_pending(task_id, &TRIGGERABLE).await? {
            return Ok(DispatchOutcome::Refused(format!("任务 {task_id} 正在执行")));
        }

        let queue = BrokerConfig::direct_queue(worker_id);
        let published = async {
            self.broker.declare_queue(&queue, true).await?;
            self.publish(
                &task,
                &queue,
                Priority::MANUAL_TRIGGER,
                self.clock.now(),
                Some(worker_id),
            )
            .await
        }
        .await;
        if let Err(e) = published {
            self.revert_armed(&task).await;
            return Err(e);
        }

        info!("任务 {} 已定向派发到Worker {}", task_id, worker_id);
        Ok(DispatchOutcome::Dispatched)
    }

    /// 取消任务，只有 PENDING 状态能被真正取消
    pub async fn cancel(&self, task_id: i64) -> SchedulerResult<CancelOutcome> {
        let task = self
            .task_store
            .get(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        let status = if task.status == TaskStatus::Pending {
            if self
                .task_store
                .cancel_pending(task_id, "任务已被取消")
                .await?
            {
                info!("任务 {} 已取消", task_id);
                return Ok(CancelOutcome::Cancelled);
            }
            // 取消与认领竞争失败，按最新状态处理
            self.task_store
                .get(task_id)
                .await?
                .map(|t| t.status)
                .ok_or(SchedulerError::TaskNotFound { id: task_id })?
        } else {
            task.status
        };

        Ok(match status {
            TaskStatus::Running => {
                info!("任务 {} 正在执行，取消请求仅尽力而为", task_id);
                CancelOutcome::RunningBestEffort
            }
            _ => CancelOutcome::NotCancellable,
        })
    }

    /// 消息队列连接状态与各任务队列深度
    pub async fn queue_status(&self) -> QueueStatus {
        let connected = self.broker.is_connected();
        let mut queues = Vec::new();

        for name in self.broker_config.task_queues() {
            match self.broker.queue_info(&name).await {
                Ok(info) => queues.push(info),
                Err(e) => {
                    warn!("获取队列 {} 信息失败: {}", name, e);
                    queues.push(QueueInfo {
                        name,
                        message_count: 0,
                        consumer_count: 0,
                    });
                }
            }
        }

        QueueStatus { connected, queues }
    }
}
