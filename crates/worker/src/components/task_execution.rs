use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    models::{Task, TaskOutcome, TaskStatus},
    traits::{Delivery, RegistryClient, TaskContext, TaskStore, TimeProvider},
};

use crate::handlers::HandlerRegistry;

/// 一次投递的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Failed,
    /// 认领失败（已被其他Worker认领、已取消或已删除），消息已确认
    ClaimLost,
    /// 暂时性错误，消息已重新入队
    Requeued,
    /// 本Worker无法处理，消息已拒绝
    Rejected,
}

#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub claims_lost: AtomicU64,
}

/// 任务执行管理器
///
/// 负责认领协议：先条件认领，认领成功才执行，执行结果以带所有权条件的写入落库，
/// 最后确认消息。执行失败不会让消息重新入队。
pub struct TaskExecutionManager {
    worker_id: String,
    task_store: Arc<dyn TaskStore>,
    registry: Arc<dyn RegistryClient>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn TimeProvider>,
    task_timeout: Duration,
    status_update_retries: u32,
    running_tasks: Arc<RwLock<HashMap<i64, CancellationToken>>>,
    stats: Arc<ExecutionStats>,
}

impl TaskExecutionManager {
    pub fn new(
        worker_id: String,
        task_store: Arc<dyn TaskStore>,
        registry: Arc<dyn RegistryClient>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn TimeProvider>,
        task_timeout: Duration,
        status_update_retries: u32,
    ) -> Self {
        Self {
            worker_id,
            task_store,
            registry,
            handlers,
            clock,
            task_timeout,
            status_update_retries,
            running_tasks: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(ExecutionStats::default()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub async fn current_task_count(&self) -> usize {
        self.running_tasks.read().await.len()
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running_tasks.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 向正在执行的任务发送协作式取消信号
    pub async fn cancel_task(&self, task_id: i64) -> bool {
        match self.running_tasks.read().await.get(&task_id) {
            Some(token) => {
                token.cancel();
                info!("已向任务 {} 发送取消信号", task_id);
                true
            }
            None => {
                warn!("任务取消失败：任务 {} 不在运行中", task_id);
                false
            }
        }
    }

    /// 取消所有正在执行的任务，返回被取消的任务ID
    pub async fn cancel_all(&self) -> Vec<i64> {
        let running = self.running_tasks.read().await;
        for token in running.values() {
            token.cancel();
        }
        let mut ids: Vec<i64> = running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 处理一次消息投递
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let message = delivery.message.clone();
        let task_id = message.task_id;

        if let Some(target) = message.target_worker.as_deref() {
            if target != self.worker_id {
                warn!("任务 {} 的消息指定了Worker {}，当前Worker不处理", task_id, target);
                return self.settle_stale(delivery).await;
            }
        }

        if !self.handlers.supports(message.kind) {
            // 已经重投过一次仍无人处理时直接丢弃，避免在本Worker上无限循环
            let requeue = !delivery.redelivered;
            warn!(
                "Worker {} 不支持任务类型 {}，任务 {} 的消息{}",
                self.worker_id,
                message.kind,
                task_id,
                if requeue { "重新入队" } else { "被拒绝" }
            );
            if let Err(e) = delivery.nack(requeue).await {
                warn!("拒绝任务 {} 的消息失败: {}", task_id, e);
            }
            return if requeue {
                DeliveryOutcome::Requeued
            } else {
                DeliveryOutcome::Rejected
            };
        }

        let task = match self.task_store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("任务 {} 不存在，确认过期消息", task_id);
                return self.settle_stale(delivery).await;
            }
            Err(e) => return self.requeue(delivery, &e.to_string()).await,
        };

        if task.status != TaskStatus::Pending {
            debug!("任务 {} 当前状态为 {}，忽略重复投递", task_id, task.status);
            return self.settle_stale(delivery).await;
        }

        let now = self.clock.now();
        match self
            .task_store
            .conditional_claim(task_id, &self.worker_id, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("任务 {} 已被其他Worker认领或状态已变化", task_id);
                return self.settle_stale(delivery).await;
            }
            Err(e) => return self.requeue(delivery, &e.to_string()).await,
        }

        info!(
            "Worker {} 认领任务 {} ({}), 类型 {}, 第 {} 次尝试",
            self.worker_id, task_id, task.name, task.kind, message.attempt_count
        );

        let mut claimed = task;
        claimed.status = TaskStatus::Running;
        claimed.assigned_worker = Some(self.worker_id.clone());
        claimed.started_at = Some(now);
        claimed.last_run_time = Some(now);

        let outcome = self.execute(claimed, message.attempt_count).await;
        let success = outcome.is_success();
        self.write_terminal(task_id, &outcome).await;

        if let Err(e) = self
            .registry
            .record_outcome(self.worker_id.clone(), success)
            .await
        {
            warn!("更新Worker {} 执行统计失败: {}", self.worker_id, e);
        }

        if let Err(e) = delivery.ack().await {
            warn!("确认任务 {} 的消息失败: {}", task_id, e);
        }

        if success {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            DeliveryOutcome::Completed
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            DeliveryOutcome::Failed
        }
    }

    async fn execute(&self, task: Task, attempt: u32) -> TaskOutcome {
        let task_id = task.id;
        let Some(handler) = self.handlers.get(task.kind) else {
            return TaskOutcome::Failed {
                error_message: format!("不支持的任务类型: {}", task.kind),
            };
        };

        let token = CancellationToken::new();
        self.running_tasks
            .write()
            .await
            .insert(task_id, token.clone());

        let ctx = TaskContext {
            task,
            worker_id: self.worker_id.clone(),
            attempt,
            cancellation: token.clone(),
        };

        let started = std::time::Instant::now();
        let mut handle = tokio::spawn(async move { handler.execute(ctx).await });
        let outcome = match timeout(self.task_timeout, &mut handle).await {
            Ok(Ok(Ok(output))) => {
                info!("任务 {} 执行成功，耗时 {:?}", task_id, started.elapsed());
                TaskOutcome::Completed {
                    result: output.to_result_json(),
                }
            }
            Ok(Ok(Err(e))) => {
                error!("任务 {} 执行失败: {}", task_id, e);
                TaskOutcome::Failed {
                    error_message: e.to_string(),
                }
            }
            Ok(Err(join_error)) => {
                error!("任务 {} 执行异常终止: {}", task_id, join_error);
                TaskOutcome::Failed {
                    error_message: format!("任务执行异常终止: {join_error}"),
                }
            }
            Err(_) => {
                token.cancel();
                handle.abort();
                error!(
                    "任务 {} 执行超时（{}秒）",
                    task_id,
                    self.task_timeout.as_secs()
                );
                TaskOutcome::Failed {
                    error_message: format!("任务执行超时（{}秒）", self.task_timeout.as_secs()),
                }
            }
        };

        self.running_tasks.write().await.remove(&task_id);
        outcome
    }

    /// 写入终态，存储暂时不可用时按退避重试
    async fn write_terminal(&self, task_id: i64, outcome: &TaskOutcome) {
        let mut attempt = 0;
        loop {
            match self
                .task_store
                .update_terminal(task_id, &self.worker_id, outcome, self.clock.now())
                .await
            {
                Ok(true) => {
                    debug!("任务 {} 状态已更新为 {}", task_id, outcome.status());
                    return;
                }
                Ok(false) => {
                    warn!(
                        "任务 {} 已不再由Worker {} 持有（可能已被恢复扫描回收），丢弃执行结果",
                        task_id, self.worker_id
                    );
                    return;
                }
                Err(e) if attempt < self.status_update_retries => {
                    let delay = retry_delay(attempt);
                    warn!(
                        "更新任务 {} 状态失败，{}ms 后重试 ({}/{}): {}",
                        task_id,
                        delay.as_millis(),
                        attempt + 1,
                        self.status_update_retries,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "更新任务 {} 状态最终失败，等待恢复扫描处理: {}",
                        task_id, e
                    );
                    return;
                }
            }
        }
    }

    async fn settle_stale(&self, delivery: Delivery) -> DeliveryOutcome {
        let task_id = delivery.message.task_id;
        self.stats.claims_lost.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = delivery.ack().await {
            warn!("确认任务 {} 的过期消息失败: {}", task_id, e);
        }
        DeliveryOutcome::ClaimLost
    }

    async fn requeue(&self, delivery: Delivery, reason: &str) -> DeliveryOutcome {
        let task_id = delivery.message.task_id;
        warn!("认领任务 {} 时存储不可用，消息重新入队: {}", task_id, reason);
        if let Err(e) = delivery.nack(true).await {
            warn!("任务 {} 的消息重新入队失败: {}", task_id, e);
        }
        DeliveryOutcome::Requeued
    }
}

/// 指数退避加随机抖动
fn retry_delay(attempt: u32) -> Duration {
    let base = 100u64.saturating_mul(2u64.saturating_pow(attempt.min(10)));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}
