#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use scheduler_core::{
    config::{BrokerConfig, BrokerKind, DispatcherConfig, RegistryConfig},
    models::{Schedule, Task, TaskKind, TaskStatus, WorkerHeartbeat, WorkerRegistration, WorkerStatus},
    traits::{MessageBroker, TaskStore, TimeProvider},
    ManualTimeProvider,
};
use scheduler_dispatcher::{RecoveryService, TaskScheduler, WorkerRegistry};
use scheduler_infrastructure::{InMemoryBroker, InMemoryTaskStore, InMemoryWorkerStore};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        kind: BrokerKind::InMemory,
        ..Default::default()
    }
}

pub fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        stuck_threshold_seconds: 1800,
        max_recovery_attempts: 3,
        ..Default::default()
    }
}

/// 基于内存存储和内存消息队列的调度端装配
pub struct Harness {
    pub tasks: Arc<InMemoryTaskStore>,
    pub workers: Arc<InMemoryWorkerStore>,
    pub broker: Arc<InMemoryBroker>,
    pub clock: ManualTimeProvider,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub recovery: Arc<RecoveryService>,
}

impl Harness {
    pub async fn new() -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        Self::with_broker(broker.clone(), broker).await
    }

    /// `broker_impl` 注入调度器，`broker` 仅用于在测试中观察队列
    pub async fn with_broker(
        broker: Arc<InMemoryBroker>,
        broker_impl: Arc<dyn MessageBroker>,
    ) -> Self {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let workers = Arc::new(InMemoryWorkerStore::new());
        let clock = ManualTimeProvider::new(start_time());
        let time: Arc<dyn TimeProvider> = Arc::new(clock.clone());

        let registry = Arc::new(WorkerRegistry::new(
            workers.clone(),
            time.clone(),
            RegistryConfig::default(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            tasks.clone(),
            broker_impl,
            registry.clone(),
            broker_config(),
            dispatcher_config(),
            time.clone(),
        ));
        let recovery = Arc::new(RecoveryService::new(
            tasks.clone(),
            registry.clone(),
            scheduler.clone(),
            dispatcher_config(),
            time,
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
            scheduler,
            recovery,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn add_task(&self, name: &str, kind: TaskKind, schedule: Schedule) -> Task {
        let mut task = Task::new(name, kind, schedule);
        task.created_at = self.now();
        task.updated_at = self.now();
        self.tasks.insert(&task).await.unwrap()
    }

    pub async fn task(&self, id: i64) -> Task {
        self.tasks.get(id).await.unwrap().unwrap()
    }

    /// 直接改写存储中的任务
    pub async fn edit(&self, id: i64, f: impl FnOnce(&mut Task)) {
        let mut task = self.task(id).await;
        f(&mut task);
        self.tasks.put(task).await;
    }

    pub async fn register_worker(&self, id: &str, max: i32, capabilities: Vec<TaskKind>) {
        self.registry
            .register(WorkerRegistration {
                worker_id: id.to_string(),
                host: "10.0.0.5".to_string(),
                port: 8001,
                max_concurrent_tasks: max,
                capabilities,
            })
            .await
            .unwrap();
    }

    pub async fn heartbeat(&self, id: &str, current_tasks: i32, status: WorkerStatus) {
        self.registry
            .heartbeat(WorkerHeartbeat {
                worker_id: id.to_string(),
                current_tasks,
                status,
                timestamp: self.now(),
            })
            .await
            .unwrap();
    }

    /// 把任务置为由 `worker_id` 持有的 RUNNING 状态
    pub async fn mark_running(&self, id: i64, worker_id: &str, since: Duration) {
        let started = self.now() - since;
        self.edit(id, |t| {
            t.status = TaskStatus::Running;
            t.assigned_worker = Some(worker_id.to_string());
            t.started_at = Some(started);
            t.last_run_time = Some(started);
        })
        .await;
    }

    pub fn queued(&self, kind: TaskKind) -> Vec<scheduler_core::TaskMessage> {
        self.broker
            .pending_messages(broker_config().queue_for(kind))
    }
}
