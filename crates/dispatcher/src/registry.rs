use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use scheduler_core::{
    config::RegistryConfig,
    models::{
        HeartbeatAck, RegistrationOutcome, TaskKind, Worker, WorkerHeartbeat,
        WorkerRegistration,
    },
    traits::{RegistryClient, TimeProvider, WorkerStore},
    SchedulerResult,
};

/// 定向派发前的准入判断结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDecision {
    Accepted(Worker),
    Refused(String),
}

/// Worker注册中心
///
/// Worker存活状态的唯一权威来源。状态全部落在 [`WorkerStore`] 中，
/// 这里只负责准入校验、心跳超时判定和日志。
pub struct WorkerRegistry {
    store: Arc<dyn WorkerStore>,
    clock: Arc<dyn TimeProvider>,
    config: RegistryConfig,
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<dyn WorkerStore>,
        clock: Arc<dyn TimeProvider>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.config.heartbeat_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.sweep_interval_seconds)
    }

    /// 注册Worker，已注册的Worker会被重新置为 ONLINE
    pub async fn register(
        &self,
        registration: WorkerRegistration,
    ) -> SchedulerResult<RegistrationOutcome> {
        if registration.worker_id.trim().is_empty() {
            warn!("拒绝注册: Worker ID为空");
            return Ok(RegistrationOutcome::Rejected("Worker ID不能为空".to_string()));
        }

        if registration.max_concurrent_tasks <= 0 {
            warn!(
                "拒绝注册Worker {}: 最大并发数无效 {}",
                registration.worker_id, registration.max_concurrent_tasks
            );
            return Ok(RegistrationOutcome::Rejected(format!(
                "最大并发任务数必须大于0: {}",
                registration.max_concurrent_tasks
            )));
        }

        if registration.capabilities.is_empty() {
            warn!("拒绝注册Worker {}: 未声明任何能力", registration.worker_id);
            return Ok(RegistrationOutcome::Rejected(
                "Worker必须至少支持一种任务类型".to_string(),
            ));
        }

        let worker = Worker::new(registration, self.clock.now());
        self.store.upsert_worker(&worker).await?;

        info!(
            "Worker {} 注册成功: {}:{}，最大并发 {}，能力 {:?}",
            worker.worker_id,
            worker.host,
            worker.port,
            worker.max_concurrent_tasks,
            worker.capabilities
        );
        Ok(RegistrationOutcome::Registered)
    }

    /// 处理心跳，未知Worker和超出容量的心跳只记录日志
    pub async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> SchedulerResult<HeartbeatAck> {
        let ack = self
            .store
            .record_heartbeat(
                &heartbeat.worker_id,
                heartbeat.current_tasks,
                heartbeat.status,
                heartbeat.timestamp,
            )
            .await?;

        match &ack {
            HeartbeatAck::Accepted => debug!(
                "收到Worker {} 心跳: 当前任务 {}，状态 {}",
                heartbeat.worker_id, heartbeat.current_tasks, heartbeat.status
            ),
            HeartbeatAck::Stale => debug!(
                "忽略Worker {} 的过期心跳: {}",
                heartbeat.worker_id, heartbeat.timestamp
            ),
            HeartbeatAck::UnknownWorker => {
                warn!("收到未注册Worker {} 的心跳，需要重新注册", heartbeat.worker_id)
            }
            HeartbeatAck::Rejected(reason) => {
                warn!("拒绝Worker {} 的心跳: {}", heartbeat.worker_id, reason)
            }
        }

        Ok(ack)
    }

    /// 将心跳超时的存活Worker置为 OFFLINE，返回被下线的Worker ID
    pub async fn sweep_timeouts(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> SchedulerResult<Vec<String>> {
        let workers = self.store.list_online_workers().await?;
        let mut offline = Vec::new();

        for worker in workers {
            if !worker.is_heartbeat_expired(now, timeout) {
                continue;
            }

            // 扫描期间到达的新心跳会让条件更新失效
            if self
                .store
                .mark_offline(&worker.worker_id, worker.last_heartbeat)
                .await?
            {
                warn!(
                    "Worker {} 心跳超时（{}秒未响应），已标记为离线",
                    worker.worker_id,
                    worker.heartbeat_age(now).num_seconds()
                );
                offline.push(worker.worker_id);
            } else {
                debug!("Worker {} 在扫描期间发送了新心跳", worker.worker_id);
            }
        }

        Ok(offline)
    }

    /// 使用配置的超时时间和当前时钟执行一次扫描
    pub async fn sweep_expired(&self) -> SchedulerResult<Vec<String>> {
        self.sweep_timeouts(self.clock.now(), self.heartbeat_timeout())
            .await
    }

    pub async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        self.store.get_worker(worker_id).await
    }

    pub async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        self.store.list_workers().await
    }

    /// 状态存活且心跳未超时的Worker
    pub async fn live_worker_ids(&self) -> SchedulerResult<HashSet<String>> {
        let now = self.clock.now();
        let timeout = self.heartbeat_timeout();
        Ok(self
            .store
            .list_online_workers()
            .await?
            .into_iter()
            .filter(|w| !w.is_heartbeat_expired(now, timeout))
            .map(|w| w.worker_id)
            .collect())
    }

    pub async fn is_available(&self, worker_id: &str) -> SchedulerResult<bool> {
        Ok(self
            .store
            .get_worker(worker_id)
            .await?
            .is_some_and(|w| w.is_available()))
    }

    /// 定向派发准入：Worker必须存在、可用且支持该任务类型
    pub async fn check_dispatch(
        &self,
        worker_id: &str,
        kind: TaskKind,
    ) -> SchedulerResult<DispatchDecision> {
        let Some(worker) = self.store.get_worker(worker_id).await? else {
            return Ok(DispatchDecision::Refused(format!("Worker不存在: {worker_id}")));
        };

        if !worker.is_available() {
            return Ok(DispatchDecision::Refused(format!(
                "Worker {} 不可用: 状态 {}，当前任务 {}/{}",
                worker_id, worker.status, worker.current_tasks, worker.max_concurrent_tasks
            )));
        }

        if !worker.supports(kind) {
            return Ok(DispatchDecision::Refused(format!(
                "Worker {worker_id} 不支持任务类型 {kind}"
            )));
        }

        Ok(DispatchDecision::Accepted(worker))
    }

    pub async fn deregister(&self, worker_id: &str) -> SchedulerResult<bool> {
        let removed = self.store.deregister(worker_id).await?;
        if removed {
            info!("Worker {} 已注销", worker_id);
        } else {
            warn!("注销未知Worker: {}", worker_id);
        }
        Ok(removed)
    }

    pub async fn record_outcome(&self, worker_id: &str, success: bool) -> SchedulerResult<()> {
        self.store.record_task_outcome(worker_id, success).await
    }
}

#[async_trait]
impl RegistryClient for WorkerRegistry {
    async fn register(
        &self,
        registration: WorkerRegistration,
    ) -> SchedulerResult<RegistrationOutcome> {
        WorkerRegistry::register(self, registration).await
    }

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> SchedulerResult<HeartbeatAck> {
        WorkerRegistry::heartbeat(self, heartbeat).await
    }

    async fn deregister(&self, worker_id: String) -> SchedulerResult<()> {
        WorkerRegistry::deregister(self, &worker_id).await.map(|_| ())
    }

    async fn record_outcome(&self, worker_id: String, success: bool) -> SchedulerResult<()> {
        WorkerRegistry::record_outcome(self, &worker_id, success).await
    }
}
