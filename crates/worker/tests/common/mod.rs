#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use scheduler_core::{
    config::{BrokerConfig, BrokerKind, RegistryConfig, WorkerConfig},
    models::{Schedule, Task, TaskKind, TaskMessage, TaskStatus},
    traits::{
        Delivery, MessageBroker, RegistryClient, TaskContext, TaskHandler, TaskOutput, TaskStore,
        TimeProvider,
    },
    ManualTimeProvider, SchedulerError, SchedulerResult,
};
use scheduler_dispatcher::WorkerRegistry;
use scheduler_infrastructure::{InMemoryBroker, InMemoryTaskStore, InMemoryWorkerStore};
use scheduler_worker::{HandlerRegistry, TaskExecutionManager};

pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        kind: BrokerKind::InMemory,
        ..Default::default()
    }
}

pub fn worker_config(worker_id: &str, max_concurrent_tasks: i32) -> WorkerConfig {
    WorkerConfig {
        enabled: true,
        worker_id: worker_id.to_string(),
        max_concurrent_tasks,
        heartbeat_interval_seconds: 1,
        task_timeout_seconds: 30,
        drain_timeout_seconds: 5,
        ..Default::default()
    }
}

/// 处理器的行为脚本
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    Sleep(Duration),
    Panic,
    /// 一直等待取消信号
    WaitForCancel,
}

/// 可编排行为的测试处理器，同时记录调用次数和最大并发
pub struct ScriptedHandler {
    behavior: Behavior,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn execute(&self, ctx: TaskContext) -> SchedulerResult<TaskOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Succeed => Ok(TaskOutput {
                score: Some(0.93),
                status: Some("normal".to_string()),
                message: Some(format!("任务 {} 完成", ctx.task.id)),
                ..Default::default()
            }),
            Behavior::Fail(reason) => Err(SchedulerError::TaskExecution(reason.clone())),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(TaskOutput::message("done"))
            }
            Behavior::Panic => panic!("算法崩溃"),
            Behavior::WaitForCancel => {
                ctx.cancellation.cancelled().await;
                Err(SchedulerError::TaskExecution("任务已被取消".to_string()))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn handlers_for(kinds: &[TaskKind], handler: Arc<ScriptedHandler>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for kind in kinds {
        registry.register(*kind, handler.clone());
    }
    registry
}

/// Worker端测试装配：内存任务存储、内存消息队列和真实的注册中心
pub struct Harness {
    pub tasks: Arc<InMemoryTaskStore>,
    pub workers: Arc<InMemoryWorkerStore>,
    pub broker: Arc<InMemoryBroker>,
    pub clock: ManualTimeProvider,
    pub registry: Arc<WorkerRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let workers = Arc::new(InMemoryWorkerStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock = ManualTimeProvider::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let registry = Arc::new(WorkerRegistry::new(
            workers.clone(),
            Arc::new(clock.clone()),
            RegistryConfig::default(),
        ));

        for queue in broker_config().task_queues() {
            broker.declare_queue(&queue, true).await.unwrap();
        }

        Self {
            tasks,
            workers,
            broker,
            clock,
            registry,
        }
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }

    pub fn time(&self) -> Arc<dyn TimeProvider> {
        Arc::new(self.clock.clone())
    }

    pub fn registry_client(&self) -> Arc<dyn RegistryClient> {
        self.registry.clone()
    }

    pub fn execution(
        &self,
        worker_id: &str,
        handlers: HandlerRegistry,
        task_timeout: Duration,
    ) -> Arc<TaskExecutionManager> {
        Arc::new(TaskExecutionManager::new(
            worker_id.to_string(),
            self.tasks.clone(),
            self.registry_client(),
            Arc::new(handlers),
            self.time(),
            task_timeout,
            1,
        ))
    }

    pub async fn add_task(&self, name: &str, kind: TaskKind) -> Task {
        let mut task = Task::new(name, kind, Schedule::Manual);
        task.created_at = self.clock.now();
        task.updated_at = self.clock.now();
        self.tasks.insert(&task).await.unwrap()
    }

    pub async fn task(&self, id: i64) -> Task {
        self.tasks.get(id).await.unwrap().unwrap()
    }

    pub async fn publish(&self, message: &TaskMessage) {
        let queue = broker_config().queue_for(message.kind).to_string();
        self.broker.publish(&queue, message, true).await.unwrap();
    }

    pub async fn publish_task(&self, task: &Task) -> TaskMessage {
        let message = TaskMessage::new(task.id, task.kind, self.clock.now());
        self.publish(&message).await;
        message
    }

    /// 从队列中取出一条投递
    pub async fn next_delivery(&self, kind: TaskKind) -> Delivery {
        let queue = broker_config().queue_for(kind).to_string();
        let mut rx = self.broker.consume(&queue, "test", 1).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("等待投递超时")
            .expect("消费通道已关闭")
    }

    pub fn queued(&self, kind: TaskKind) -> Vec<TaskMessage> {
        self.broker.pending_messages(broker_config().queue_for(kind))
    }

    /// 轮询直到任务进入指定状态
    pub async fn wait_for_status(&self, id: i64, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.task(id).await;
            if task.status == status {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("任务 {} 未进入 {} 状态，当前为 {}", id, status, task.status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
