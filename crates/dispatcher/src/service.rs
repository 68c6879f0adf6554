use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scheduler_core::{config::DispatcherConfig, SchedulerError, SchedulerResult};

use crate::recovery_service::RecoveryService;
use crate::registry::WorkerRegistry;
use crate::scheduler::TaskScheduler;

struct RunningLoops {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// 调度端服务
///
/// 持有三个独立的定时循环：入队扫描、卡死任务恢复、Worker心跳超时扫描。
/// 单个周期内的错误或panic只记录日志，不影响下一个周期。
pub struct DispatcherService {
    scheduler: Arc<TaskScheduler>,
    recovery: Arc<RecoveryService>,
    registry: Arc<WorkerRegistry>,
    config: DispatcherConfig,
    running: Mutex<Option<RunningLoops>>,
}

impl DispatcherService {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        recovery: Arc<RecoveryService>,
        registry: Arc<WorkerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            scheduler,
            recovery,
            registry,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.scheduler.clone()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn start(&self) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::Internal("调度服务已在运行".to_string()));
        }

        if let Err(e) = self.scheduler.declare_queues().await {
            warn!("启动时声明任务队列失败，将在入队时重试: {}", e);
        }

        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(3);

        let scheduler = self.scheduler.clone();
        handles.push(spawn_tick(
            "入队扫描",
            Duration::from_secs(self.config.schedule_interval_seconds),
            token.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.enqueue_eligible_tasks().await {
                        error!("入队扫描失败，跳过本轮: {}", e);
                    }
                }
            },
        ));

        let recovery = self.recovery.clone();
        handles.push(spawn_tick(
            "卡死任务恢复",
            Duration::from_secs(self.config.recovery_interval_seconds),
            token.clone(),
            move || {
                let recovery = recovery.clone();
                async move {
                    if let Err(e) = recovery.recover_stuck_tasks().await {
                        error!("卡死任务扫描失败，跳过本轮: {}", e);
                    }
                }
            },
        ));

        let registry = self.registry.clone();
        handles.push(spawn_tick(
            "心跳超时扫描",
            registry.sweep_interval(),
            token.clone(),
            move || {
                let registry = registry.clone();
                async move {
                    if let Err(e) = registry.sweep_expired().await {
                        error!("Worker心跳超时扫描失败，跳过本轮: {}", e);
                    }
                }
            },
        ));

        *running = Some(RunningLoops { token, handles });
        info!(
            "调度服务已启动: 入队间隔 {}秒，恢复间隔 {}秒，卡死阈值 {}秒",
            self.config.schedule_interval_seconds,
            self.config.recovery_interval_seconds,
            self.config.stuck_threshold_seconds
        );
        Ok(())
    }

    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(loops) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("正在停止调度服务");
        loops.token.cancel();
        for handle in loops.handles {
            if let Err(e) = handle.await {
                error!("调度循环异常退出: {}", e);
            }
        }
        info!("调度服务已停止");
        Ok(())
    }
}

fn spawn_tick<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("{}循环已停止", name);
                    break;
                }
                _ = ticker.tick() => {
                    // 每轮在独立任务中执行，单轮panic不终止循环
                    if let Err(e) = tokio::spawn(tick()).await {
                        error!("{}本轮异常退出: {}", name, e);
                    }
                }
            }
        }
    })
}
