use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{
    models::TaskMessage,
    traits::{Delivery, DeliveryAcker, MessageBroker, QueueInfo},
    SchedulerError, SchedulerResult,
};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 消费者在没有收到通知时重新检查队列的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: TaskMessage,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    consumers: u32,
    durable: bool,
}

#[derive(Debug)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl BrokerState {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> SchedulerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SchedulerError::BrokerUnavailable(
                "内存消息队列处于断开状态".to_string(),
            ))
        }
    }

    fn push_back(&self, queue: &str, entry: QueuedMessage) -> SchedulerResult<()> {
        {
            let mut queues = self.queues();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| SchedulerError::MessageQueue(format!("队列不存在: {queue}")))?;
            state.messages.push_back(entry);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// 未确认的消息回到队首，并标记为重投
    fn requeue_front(&self, queue: &str, message: TaskMessage) {
        {
            let mut queues = self.queues();
            if let Some(state) = queues.get_mut(queue) {
                state.messages.push_front(QueuedMessage {
                    message,
                    redelivered: true,
                });
            }
        }
        self.notify.notify_waiters();
    }

    fn pop_front(&self, queue: &str) -> Option<QueuedMessage> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        self.queues()
            .get_mut(queue)
            .and_then(|state| state.messages.pop_front())
    }

    fn adjust_consumers(&self, queue: &str, attach: bool) {
        if let Some(state) = self.queues().get_mut(queue) {
            if attach {
                state.consumers += 1;
            } else {
                state.consumers = state.consumers.saturating_sub(1);
            }
        }
    }
}

/// 内存消息队列的确认句柄
///
/// 持有消费者的预取许可；句柄被丢弃时许可随之归还。
/// 未确认就被丢弃的消息会回到队首。
struct InMemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    message: TaskMessage,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> SchedulerResult<()> {
        self.state.ensure_connected()?;
        self.settled.store(true, Ordering::SeqCst);
        debug!(queue = %self.queue, task_id = self.message.task_id, "消息已确认");
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> SchedulerResult<()> {
        self.state.ensure_connected()?;
        self.settled.store(true, Ordering::SeqCst);
        if requeue {
            self.state.requeue_front(&self.queue, self.message.clone());
        }
        debug!(
            queue = %self.queue,
            task_id = self.message.task_id,
            requeue,
            "消息已拒绝"
        );
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.state.requeue_front(&self.queue, self.message.clone());
        }
    }
}

/// 进程内消息队列
///
/// 与 RabbitMQ 实现遵守相同的契约：至少一次投递、显式确认、按消费者预取。
/// 用于嵌入式部署和确定性的多Worker测试。
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                connected: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 模拟连接中断与恢复
    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.state.notify.notify_waiters();
        }
        info!("内存消息队列连接状态: {}", connected);
    }

    /// 当前排队（未投递）的消息
    pub fn pending_messages(&self, queue: &str) -> Vec<TaskMessage> {
        self.state
            .queues()
            .get(queue)
            .map(|state| state.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.state.queues().get(queue).map(|state| state.durable)
    }

    async fn run_consumer(
        state: Arc<BrokerState>,
        queue: String,
        consumer_tag: String,
        prefetch: Arc<Semaphore>,
        tx: mpsc::Sender<Delivery>,
    ) {
        state.adjust_consumers(&queue, true);
        debug!(queue = %queue, consumer_tag = %consumer_tag, "消费者已启动");

        'outer: loop {
            let permit = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tx.closed() => break,
                permit = prefetch.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let entry = loop {
                if let Some(entry) = state.pop_front(&queue) {
                    break entry;
                }
                tokio::select! {
                    _ = state.shutdown.cancelled() => break 'outer,
                    _ = tx.closed() => break 'outer,
                    _ = state.notify.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            };

            let acker = InMemoryAcker {
                state: state.clone(),
                queue: queue.clone(),
                message: entry.message.clone(),
                settled: AtomicBool::new(false),
                _permit: permit,
            };
            let delivery = Delivery::new(
                entry.message,
                queue.clone(),
                entry.redelivered,
                Box::new(acker),
            );

            // 接收端已关闭时投递被丢弃，消息经由确认句柄回到队首
            if tx.send(delivery).await.is_err() {
                break;
            }
        }

        state.adjust_consumers(&queue, false);
        debug!(queue = %queue, consumer_tag = %consumer_tag, "消费者已退出");
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn connect(&self) -> SchedulerResult<()> {
        self.set_connected(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()> {
        self.state.ensure_connected()?;
        self.state
            .queues()
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                durable,
                ..Default::default()
            });
        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        message: &TaskMessage,
        _durable: bool,
    ) -> SchedulerResult<()> {
        self.state.ensure_connected()?;
        self.state.push_back(
            queue,
            QueuedMessage {
                message: message.clone(),
                redelivered: false,
            },
        )?;
        debug!(queue = %queue, task_id = message.task_id, "消息已发布");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> SchedulerResult<mpsc::Receiver<Delivery>> {
        self.state.ensure_connected()?;
        if !self.state.queues().contains_key(queue) {
            return Err(SchedulerError::MessageQueue(format!("队列不存在: {queue}")));
        }

        let prefetch = prefetch_count.max(1) as usize;
        let (tx, rx) = mpsc::channel(prefetch);
        tokio::spawn(Self::run_consumer(
            self.state.clone(),
            queue.to_string(),
            consumer_tag.to_string(),
            Arc::new(Semaphore::new(prefetch)),
            tx,
        ));
        Ok(rx)
    }

    async fn queue_info(&self, queue: &str) -> SchedulerResult<QueueInfo> {
        let queues = self.state.queues();
        Ok(match queues.get(queue) {
            Some(state) => QueueInfo {
                name: queue.to_string(),
                message_count: state.messages.len() as u32,
                consumer_count: state.consumers,
            },
            None => QueueInfo {
                name: queue.to_string(),
                message_count: 0,
                consumer_count: 0,
            },
        })
    }

    async fn close(&self) -> SchedulerResult<()> {
        self.state.shutdown.cancel();
        info!("内存消息队列已关闭");
        Ok(())
    }
}
