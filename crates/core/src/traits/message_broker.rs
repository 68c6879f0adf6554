use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{models::TaskMessage, SchedulerResult};

/// 消息确认句柄，由具体的消息队列实现提供
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> SchedulerResult<()>;

    async fn nack(&self, requeue: bool) -> SchedulerResult<()>;
}

/// 一次消息投递
///
/// 投递必须被显式 `ack` 或 `nack`，不存在自动确认。
pub struct Delivery {
    pub message: TaskMessage,
    pub queue: String,
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        message: TaskMessage,
        queue: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            message,
            queue: queue.into(),
            redelivered,
            acker,
        }
    }

    /// 确认消息处理完成
    pub async fn ack(self) -> SchedulerResult<()> {
        self.acker.ack().await
    }

    /// 拒绝消息，`requeue` 为 true 时重新入队
    pub async fn nack(self, requeue: bool) -> SchedulerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("queue", &self.queue)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// 队列观测信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// 消息队列抽象接口
///
/// 实现方保证至少一次投递；重复投递由认领协议在上层消化，这里不做去重。
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// 建立连接，失败时按指数退避重试
    async fn connect(&self) -> SchedulerResult<()>;

    fn is_connected(&self) -> bool;

    /// 声明队列
    async fn declare_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()>;

    /// 发布消息并等待确认；返回错误即表示消息未入队
    async fn publish(
        &self,
        queue: &str,
        message: &TaskMessage,
        durable: bool,
    ) -> SchedulerResult<()>;

    /// 注册消费者，投递通过通道送出
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> SchedulerResult<mpsc::Receiver<Delivery>>;

    /// 获取队列深度与消费者数量
    async fn queue_info(&self, queue: &str) -> SchedulerResult<QueueInfo>;

    async fn close(&self) -> SchedulerResult<()>;
}
