use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    models::{HeartbeatAck, RegistrationOutcome, WorkerHeartbeat, WorkerRegistration, WorkerStatus},
    traits::{RegistryClient, TimeProvider},
    SchedulerResult,
};

use super::TaskExecutionManager;

/// 心跳管理器
///
/// 心跳失败只计数和记录日志，不影响任务执行；长时间失败的Worker会被注册中心判定为离线。
pub struct HeartbeatManager {
    registration: WorkerRegistration,
    registry: Arc<dyn RegistryClient>,
    execution: Arc<TaskExecutionManager>,
    clock: Arc<dyn TimeProvider>,
    heartbeat_interval: Duration,
    consecutive_failures: AtomicU32,
}

impl HeartbeatManager {
    pub fn new(
        registration: WorkerRegistration,
        registry: Arc<dyn RegistryClient>,
        execution: Arc<TaskExecutionManager>,
        clock: Arc<dyn TimeProvider>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registration,
            registry,
            execution,
            clock,
            heartbeat_interval,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// 上报一次心跳；注册中心不认识本Worker时重新注册
    pub async fn send_heartbeat(&self) -> SchedulerResult<HeartbeatAck> {
        let current_tasks = self.execution.current_task_count().await as i32;
        let status = if current_tasks >= self.registration.max_concurrent_tasks {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Online
        };

        let ack = self
            .registry
            .heartbeat(WorkerHeartbeat {
                worker_id: self.registration.worker_id.clone(),
                current_tasks,
                status,
                timestamp: self.clock.now(),
            })
            .await?;

        match &ack {
            HeartbeatAck::Accepted => {
                debug!(
                    "心跳已发送: Worker {}，当前任务 {}，状态 {}",
                    self.registration.worker_id, current_tasks, status
                );
            }
            HeartbeatAck::UnknownWorker => {
                warn!(
                    "注册中心未找到Worker {}，重新注册",
                    self.registration.worker_id
                );
                match self.registry.register(self.registration.clone()).await? {
                    RegistrationOutcome::Registered => {
                        info!("Worker {} 重新注册成功", self.registration.worker_id)
                    }
                    RegistrationOutcome::Rejected(reason) => {
                        error!("Worker {} 重新注册被拒绝: {}", self.registration.worker_id, reason)
                    }
                }
            }
            HeartbeatAck::Stale => debug!("心跳时间戳早于已记录值，已被忽略"),
            HeartbeatAck::Rejected(reason) => warn!("心跳被拒绝: {}", reason),
        }

        Ok(ack)
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.send_heartbeat().await {
                            Ok(_) => {
                                self.consecutive_failures.store(0, Ordering::Relaxed);
                            }
                            Err(e) => {
                                let failures =
                                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                                error!("发送心跳失败（连续 {} 次）: {}", failures, e);
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("心跳任务已停止");
                        break;
                    }
                }
            }
        })
    }
}
