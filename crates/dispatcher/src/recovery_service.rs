use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use scheduler_core::{
    config::DispatcherConfig,
    models::{Schedule, Task, Worker},
    traits::{TaskStore, TimeProvider},
    SchedulerResult,
};

use crate::registry::WorkerRegistry;
use crate::scheduler::{TaskScheduler, TriggerOutcome};

/// 周期任务恢复后的退避步长，第 n 次恢复推迟 n 个步长
const RECOVERY_BACKOFF_MINUTES: i64 = 5;

/// 卡死任务的判定原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryReason {
    /// RUNNING 但没有持有者或认领时间
    NeverStarted,
    /// 持有者不在注册中心中
    WorkerMissing,
    /// 持有者已离线或心跳超时
    NoHeartbeat,
    /// 执行时间超过卡死阈值
    Timeout,
}

impl RecoveryReason {
    pub fn description(&self) -> &'static str {
        match self {
            RecoveryReason::NeverStarted => "任务处于运行状态但从未开始执行",
            RecoveryReason::WorkerMissing => "执行该任务的Worker不存在",
            RecoveryReason::NoHeartbeat => "执行该任务的Worker心跳丢失",
            RecoveryReason::Timeout => "任务执行超时",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// 恢复报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: usize,
    pub failed_permanently: usize,
    pub reasons: Vec<(i64, RecoveryReason)>,
}

/// 判断一个 RUNNING 任务是否卡死
pub fn classify_stuck(
    task: &Task,
    workers: &HashMap<String, Worker>,
    now: DateTime<Utc>,
    stuck_threshold: Duration,
    heartbeat_timeout: Duration,
) -> Option<RecoveryReason> {
    let (Some(worker_id), Some(last_run_time)) = (&task.assigned_worker, task.last_run_time)
    else {
        return Some(RecoveryReason::NeverStarted);
    };

    let Some(worker) = workers.get(worker_id) else {
        return Some(RecoveryReason::WorkerMissing);
    };

    if !worker.status.is_live() || worker.is_heartbeat_expired(now, heartbeat_timeout) {
        return Some(RecoveryReason::NoHeartbeat);
    }

    if now - last_run_time > stuck_threshold {
        return Some(RecoveryReason::Timeout);
    }

    None
}

/// 卡死任务恢复服务
pub struct RecoveryService {
    task_store: Arc<dyn TaskStore>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<TaskScheduler>,
    config: DispatcherConfig,
    clock: Arc<dyn TimeProvider>,
}

impl RecoveryService {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<TaskScheduler>,
        config: DispatcherConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            task_store,
            registry,
            scheduler,
            config,
            clock,
        }
    }

    /// 扫描所有 RUNNING 任务，回收失去持有者或超时的任务
    pub async fn recover_stuck_tasks(&self) -> SchedulerResult<RecoveryReport> {
        let now = self.clock.now();
        let workers: HashMap<String, Worker> = self
            .registry
            .list_workers()
            .await?
            .into_iter()
            .map(|w| (w.worker_id.clone(), w))
            .collect();
        let running = self.task_store.fetch_running().await?;

        let stuck_threshold = Duration::seconds(self.config.stuck_threshold_seconds);
        let heartbeat_timeout = self.registry.heartbeat_timeout();
        let mut report = RecoveryReport {
            scanned: running.len(),
            ..Default::default()
        };

        for task in running {
            let Some(reason) =
                classify_stuck(&task, &workers, now, stuck_threshold, heartbeat_timeout)
            else {
                continue;
            };

            match self.recover_task(&task, reason, now).await {
                Ok(Some(true)) => {
                    report.recovered += 1;
                    report.reasons.push((task.id, reason));
                }
                Ok(Some(false)) => {
                    report.failed_permanently += 1;
                    report.reasons.push((task.id, reason));
                }
                Ok(None) => {}
                Err(e) => warn!("恢复任务 {} 失败: {}", task.id, e),
            }
        }

        if report.recovered > 0 || report.failed_permanently > 0 {
            info!(
                "卡死任务扫描完成: 扫描 {}，恢复 {}，永久失败 {}",
                report.scanned, report.recovered, report.failed_permanently
            );
        } else {
            debug!("卡死任务扫描完成: 扫描 {}，无需恢复", report.scanned);
        }

        Ok(report)
    }

    /// `Some(true)` 表示已重置为 PENDING，`Some(false)` 表示已置为 FAILED，
    /// `None` 表示条件更新未命中
    async fn recover_task(
        &self,
        task: &Task,
        reason: RecoveryReason,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<bool>> {
        let worker = task.assigned_worker.as_deref();

        if task.recovery_count >= self.config.max_recovery_attempts {
            let message = format!(
                "超过最大恢复次数({}): {}",
                self.config.max_recovery_attempts, reason
            );
            if self
                .task_store
                .fail_stuck(task.id, worker, &message, now)
                .await?
            {
                warn!(
                    "任务 {} ({}) {}，已恢复 {} 次，标记为失败",
                    task.id, task.name, reason, task.recovery_count
                );
                return Ok(Some(false));
            }
            debug!("任务 {} 在回收前已完成或被其他参与方处理", task.id);
            return Ok(None);
        }

        if !self
            .task_store
            .reset_to_pending(task.id, worker, reason.description())
            .await?
        {
            debug!("任务 {} 在回收前已完成或被其他参与方处理", task.id);
            return Ok(None);
        }

        warn!(
            "任务 {} ({}) 已重置为待执行: {}，原Worker {:?}，第 {} 次恢复",
            task.id,
            task.name,
            reason,
            worker,
            task.recovery_count + 1
        );

        if matches!(task.schedule, Schedule::Interval { .. } | Schedule::Cron { .. }) {
            let backoff =
                Duration::minutes(RECOVERY_BACKOFF_MINUTES * i64::from(task.recovery_count + 1));
            let retry_at = now + backoff;
            if let Err(e) = self.task_store.advance_schedule(task.id, Some(retry_at)).await {
                warn!("设置任务 {} 的重试时间失败: {}", task.id, e);
            } else {
                debug!("任务 {} 将在 {} 后重新调度", task.id, retry_at);
            }
        }

        // 手动任务不会被周期调度选中，需要立即重新发布
        if task.is_manual() {
            match self.scheduler.trigger_now(task.id).await {
                Ok(TriggerOutcome::Enqueued) => {
                    info!("手动任务 {} 已重新发布", task.id)
                }
                Ok(outcome) => debug!("手动任务 {} 未重新发布: {:?}", task.id, outcome),
                Err(e) => warn!("手动任务 {} 重新发布失败: {}", task.id, e),
            }
        }

        Ok(Some(true))
    }
}
