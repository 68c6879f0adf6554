use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scheduler_core::traits::Delivery;

use super::TaskExecutionManager;

/// 单个队列的消费循环
///
/// 先等到投递再申请执行槽位，空闲队列不占用槽位；槽位在任务处理完成后释放。
/// 所有队列共享同一个信号量，因此整个Worker的并发不超过上限。
/// 等待槽位期间收到关闭信号时，手上的投递退回队列。
pub struct QueueConsumer {
    queue: String,
    deliveries: mpsc::Receiver<Delivery>,
    execution: Arc<TaskExecutionManager>,
    slots: Arc<Semaphore>,
}

impl QueueConsumer {
    pub fn new(
        queue: impl Into<String>,
        deliveries: mpsc::Receiver<Delivery>,
        execution: Arc<TaskExecutionManager>,
        slots: Arc<Semaphore>,
    ) -> Self {
        Self {
            queue: queue.into(),
            deliveries,
            execution,
            slots,
        }
    }

    pub fn start(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("开始消费队列 {}", self.queue);

            loop {
                let delivery = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    delivery = self.deliveries.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => {
                            warn!("队列 {} 的消费通道已关闭", self.queue);
                            break;
                        }
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    permit = self.slots.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    let task_id = delivery.message.task_id;
                    if let Err(e) = delivery.nack(true).await {
                        warn!("退回任务 {} 的消息失败: {}", task_id, e);
                    }
                    break;
                };

                debug!(
                    "从队列 {} 收到任务 {} 的消息（重投: {}）",
                    self.queue, delivery.message.task_id, delivery.redelivered
                );

                let execution = self.execution.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    execution.process_delivery(delivery).await;
                });
            }

            info!("队列 {} 的消费循环已退出", self.queue);
        })
    }
}
