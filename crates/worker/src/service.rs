use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use scheduler_core::{
    config::{BrokerConfig, WorkerConfig},
    models::{RegistrationOutcome, WorkerRegistration},
    traits::{MessageBroker, RegistryClient, SystemTimeProvider, TaskStore, TimeProvider},
    SchedulerError, SchedulerResult,
};

use crate::components::{HeartbeatManager, QueueConsumer, TaskExecutionManager};
use crate::handlers::HandlerRegistry;

/// 取消运行中任务后等待其写回结果的时间
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Worker运行统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub claims_lost: u64,
    pub current_tasks: usize,
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    config: WorkerConfig,
    broker_config: BrokerConfig,
    task_store: Arc<dyn TaskStore>,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<dyn RegistryClient>,
    handlers: Option<HandlerRegistry>,
    clock: Arc<dyn TimeProvider>,
}

impl WorkerServiceBuilder {
    pub fn new(
        config: WorkerConfig,
        broker_config: BrokerConfig,
        task_store: Arc<dyn TaskStore>,
        broker: Arc<dyn MessageBroker>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            config,
            broker_config,
            task_store,
            broker,
            registry,
            handlers: None,
            clock: Arc::new(SystemTimeProvider),
        }
    }

    /// 使用自定义处理器，未设置时按配置的执行服务地址创建HTTP处理器
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> SchedulerResult<WorkerService> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        let handlers = match self.handlers {
            Some(handlers) => handlers,
            None => HandlerRegistry::from_endpoints(&self.config.handlers)?,
        };

        let missing: Vec<String> = self
            .config
            .capabilities
            .iter()
            .filter(|kind| !handlers.supports(**kind))
            .map(|kind| kind.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "以下任务类型没有可用的处理器: {}",
                missing.join(", ")
            )));
        }

        let worker_id = if self.config.worker_id.trim().is_empty() {
            generate_worker_id()
        } else {
            self.config.worker_id.clone()
        };

        let execution = Arc::new(TaskExecutionManager::new(
            worker_id.clone(),
            self.task_store,
            self.registry.clone(),
            Arc::new(handlers),
            self.clock.clone(),
            Duration::from_secs(self.config.task_timeout_seconds),
            self.config.status_update_retries,
        ));

        let registration = WorkerRegistration {
            worker_id: worker_id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            capabilities: self.config.capabilities.clone(),
        };

        let heartbeat = Arc::new(HeartbeatManager::new(
            registration.clone(),
            self.registry.clone(),
            execution.clone(),
            self.clock,
            Duration::from_secs(self.config.heartbeat_interval_seconds),
        ));

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_tasks as usize));

        Ok(WorkerService {
            worker_id,
            registration,
            config: self.config,
            broker_config: self.broker_config,
            broker: self.broker,
            registry: self.registry,
            execution,
            heartbeat,
            slots,
            running: Mutex::new(None),
        })
    }
}

struct RunningWorker {
    consumer_token: CancellationToken,
    consumers: Vec<JoinHandle<()>>,
    heartbeat_token: CancellationToken,
    heartbeat: JoinHandle<()>,
}

/// Worker服务
///
/// 启动时注册并订阅自身能力对应的队列及专属队列；停止时先停止取消息，
/// 在排空超时内等待执行中的任务完成，超时后取消剩余任务，最后注销。
pub struct WorkerService {
    worker_id: String,
    registration: WorkerRegistration,
    config: WorkerConfig,
    broker_config: BrokerConfig,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<dyn RegistryClient>,
    execution: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    slots: Arc<Semaphore>,
    running: Mutex<Option<RunningWorker>>,
}

impl WorkerService {
    pub fn builder(
        config: WorkerConfig,
        broker_config: BrokerConfig,
        task_store: Arc<dyn TaskStore>,
        broker: Arc<dyn MessageBroker>,
        registry: Arc<dyn RegistryClient>,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(config, broker_config, task_store, broker, registry)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn execution(&self) -> &Arc<TaskExecutionManager> {
        &self.execution
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// 本Worker订阅的队列：能力对应的共享队列加专属队列
    pub fn subscribed_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .config
            .capabilities
            .iter()
            .map(|kind| self.broker_config.queue_for(*kind).to_string())
            .collect();
        queues.push(BrokerConfig::direct_queue(&self.worker_id));
        queues
    }

    pub async fn start(&self) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::Internal(format!(
                "Worker {} 已在运行",
                self.worker_id
            )));
        }

        info!(
            "启动Worker {}，能力: {:?}，最大并发 {}",
            self.worker_id, self.config.capabilities, self.config.max_concurrent_tasks
        );

        match self.registry.register(self.registration.clone()).await? {
            RegistrationOutcome::Registered => {}
            RegistrationOutcome::Rejected(reason) => {
                return Err(SchedulerError::Configuration(format!(
                    "Worker注册被拒绝: {reason}"
                )));
            }
        }

        let prefetch = self.config.max_concurrent_tasks.clamp(1, u16::MAX as i32) as u16;
        let consumer_token = CancellationToken::new();
        let mut consumers = Vec::new();

        for queue in self.subscribed_queues() {
            self.broker.declare_queue(&queue, true).await?;
            let consumer_tag = format!("{}-{}", self.worker_id, queue);
            let deliveries = self.broker.consume(&queue, &consumer_tag, prefetch).await?;
            let consumer = QueueConsumer::new(
                queue,
                deliveries,
                self.execution.clone(),
                self.slots.clone(),
            );
            consumers.push(consumer.start(consumer_token.clone()));
        }

        let heartbeat_token = CancellationToken::new();
        let heartbeat = self.heartbeat.clone().start(heartbeat_token.clone());

        *running = Some(RunningWorker {
            consumer_token,
            consumers,
            heartbeat_token,
            heartbeat,
        });

        info!("Worker {} 启动完成", self.worker_id);
        Ok(())
    }

    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("停止Worker {}", self.worker_id);

        running.consumer_token.cancel();
        for handle in running.consumers {
            if let Err(e) = handle.await {
                warn!("消费任务退出异常: {}", e);
            }
        }

        let total = self.config.max_concurrent_tasks as u32;
        let drain = Duration::from_secs(self.config.drain_timeout_seconds);
        match timeout(drain, self.slots.acquire_many(total)).await {
            Ok(_) => info!("执行中的任务已全部完成"),
            Err(_) => {
                let cancelled = self.execution.cancel_all().await;
                warn!(
                    "排空超时（{}秒），已取消仍在执行的任务: {:?}",
                    drain.as_secs(),
                    cancelled
                );
                if timeout(CANCEL_GRACE, self.slots.acquire_many(total))
                    .await
                    .is_err()
                {
                    error!("被取消的任务未能在宽限期内结束，交由恢复扫描处理");
                }
            }
        }

        running.heartbeat_token.cancel();
        if let Err(e) = running.heartbeat.await {
            warn!("心跳任务退出异常: {}", e);
        }

        if let Err(e) = self.broker.close().await {
            warn!("关闭消息队列连接失败: {}", e);
        }

        if let Err(e) = self.registry.deregister(self.worker_id.clone()).await {
            warn!("注销Worker {} 失败: {}", self.worker_id, e);
        }

        info!("Worker {} 已停止", self.worker_id);
        Ok(())
    }

    pub async fn stats(&self) -> WorkerStats {
        let stats = self.execution.stats();
        WorkerStats {
            worker_id: self.worker_id.clone(),
            tasks_completed: stats.completed.load(Ordering::Relaxed),
            tasks_failed: stats.failed.load(Ordering::Relaxed),
            claims_lost: stats.claims_lost.load(Ordering::Relaxed),
            current_tasks: self.execution.current_task_count().await,
        }
    }
}

/// 生成 `worker-{hostname}-{8位随机后缀}` 形式的Worker ID
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", host, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_worker_id_format() {
        let id = generate_worker_id();
        assert!(id.starts_with("worker-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert_ne!(id, generate_worker_id());
    }
}
