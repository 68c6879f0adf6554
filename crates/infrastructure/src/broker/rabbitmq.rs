use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use scheduler_core::{
    config::BrokerConfig,
    models::TaskMessage,
    traits::{Delivery, DeliveryAcker, MessageBroker, QueueInfo},
    SchedulerError, SchedulerResult,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Session {
    connection: Connection,
    channel: Channel,
}

struct RabbitMqInner {
    config: BrokerConfig,
    session: RwLock<Option<Arc<Session>>>,
    shutdown: CancellationToken,
}

impl RabbitMqInner {
    async fn open_session(&self) -> SchedulerResult<Session> {
        let timeout = Duration::from_secs(self.config.connection_timeout_seconds);
        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(&self.config.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| SchedulerError::BrokerUnavailable("连接RabbitMQ超时".to_string()))?
        .map_err(|e| SchedulerError::BrokerUnavailable(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建通道失败: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        Ok(Session {
            connection,
            channel,
        })
    }

    /// 建立连接，按指数退避重试直到成功或次数用尽
    async fn connect_with_retry(&self) -> SchedulerResult<Arc<Session>> {
        let max_attempts = self.config.reconnect_max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            match self.open_session().await {
                Ok(session) => {
                    let session = Arc::new(session);
                    *self.session.write().await = Some(session.clone());
                    info!("成功连接到RabbitMQ: {}", self.config.url);
                    return Ok(session);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        error!("连接RabbitMQ失败，已重试{}次: {}", attempt, e);
                        return Err(SchedulerError::BrokerUnavailable(format!(
                            "连接RabbitMQ失败，已重试{attempt}次: {e}"
                        )));
                    }

                    let delay = self.config.reconnect_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "连接RabbitMQ失败，稍后重试: {}",
                        e
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(SchedulerError::BrokerUnavailable("消息队列已关闭".to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 当前可用的会话，断开时重新连接
    async fn session(&self) -> SchedulerResult<Arc<Session>> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::BrokerUnavailable(
                "消息队列已关闭".to_string(),
            ));
        }

        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.connection.status().connected() && session.channel.status().connected()
                {
                    return Ok(session.clone());
                }
            }
        }

        warn!("RabbitMQ连接已断开，尝试重新连接");
        self.connect_with_retry().await
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-max-priority".into(),
            AMQPValue::ShortShortUInt(self.config.max_priority),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(self.config.message_ttl_ms.min(i32::MAX as u32) as i32),
        );
        args
    }

    async fn open_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> SchedulerResult<Consumer> {
        let session = self.session().await?;

        session
            .channel
            .basic_qos(prefetch_count.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("设置预取数量失败: {e}")))?;

        let consumer = session
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建消费者失败: {e}")))?;

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);
        Ok(consumer)
    }

    /// 消费流中断后重新订阅，直到成功或被关闭
    async fn resubscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
        tx: &mpsc::Sender<Delivery>,
    ) -> Option<Consumer> {
        let mut attempt = 0u32;
        loop {
            match self.open_consumer(queue, consumer_tag, prefetch_count).await {
                Ok(consumer) => {
                    info!(queue = %queue, "消费者已重新订阅");
                    return Some(consumer);
                }
                Err(e) => {
                    let delay = self.config.reconnect_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(queue = %queue, attempt, "重新订阅失败: {}", e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tx.closed() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn forward(
        self: Arc<Self>,
        queue: String,
        consumer_tag: String,
        prefetch_count: u16,
        mut consumer: Consumer,
        tx: mpsc::Sender<Delivery>,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tx.closed() => break,
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let redelivered = delivery.redelivered;
                    match TaskMessage::from_bytes(&delivery.data) {
                        Ok(message) => {
                            let acker = RabbitMqAcker::new(delivery.acker);
                            let delivery =
                                Delivery::new(message, queue.clone(), redelivered, Box::new(acker));
                            if tx.send(delivery).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(queue = %queue, "无法解析的消息，丢弃: {}", e);
                            let options = BasicNackOptions {
                                requeue: false,
                                ..Default::default()
                            };
                            if let Err(e) = delivery.acker.nack(options).await {
                                warn!(queue = %queue, "拒绝无效消息失败: {}", e);
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(queue = %queue, "消费流出错: {}", e);
                    match self
                        .resubscribe(&queue, &consumer_tag, prefetch_count, &tx)
                        .await
                    {
                        Some(c) => consumer = c,
                        None => break,
                    }
                }
                None => {
                    warn!(queue = %queue, "消费流已结束");
                    match self
                        .resubscribe(&queue, &consumer_tag, prefetch_count, &tx)
                        .await
                    {
                        Some(c) => consumer = c,
                        None => break,
                    }
                }
            }
        }

        debug!(queue = %queue, consumer_tag = %consumer_tag, "消费者转发任务退出");
    }
}

/// RabbitMQ投递的确认句柄
///
/// 未确认就被丢弃时在后台拒绝并重新入队，避免消息滞留到通道关闭。
struct RabbitMqAcker {
    acker: Acker,
    settled: AtomicBool,
}

impl RabbitMqAcker {
    fn new(acker: Acker) -> Self {
        Self {
            acker,
            settled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DeliveryAcker for RabbitMqAcker {
    async fn ack(&self) -> SchedulerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| SchedulerError::MessageQueue(format!("确认消息失败: {e}")))?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> SchedulerResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| SchedulerError::MessageQueue(format!("拒绝消息失败: {e}")))?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for RabbitMqAcker {
    fn drop(&mut self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let acker = self.acker.clone();
            handle.spawn(async move {
                let options = BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                };
                if let Err(e) = acker.nack(options).await {
                    debug!("回退未确认消息失败: {}", e);
                }
            });
        }
    }
}

/// RabbitMQ消息队列实现
///
/// 一个连接加一个开启发布确认的通道；连接断开时按配置的指数退避自动重连。
pub struct RabbitMqBroker {
    inner: Arc<RabbitMqInner>,
}

impl RabbitMqBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(RabbitMqInner {
                config,
                session: RwLock::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn connect(&self) -> SchedulerResult<()> {
        self.inner.connect_with_retry().await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        match self.inner.session.try_read() {
            Ok(guard) => guard
                .as_ref()
                .map(|s| s.connection.status().connected())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()> {
        let session = self.inner.session().await?;
        session
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                self.inner.queue_arguments(),
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("声明队列 {queue} 失败: {e}"))
            })?;

        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        message: &TaskMessage,
        durable: bool,
    ) -> SchedulerResult<()> {
        let session = self.inner.session().await?;
        let payload = message.to_bytes()?;

        let properties = BasicProperties::default()
            .with_delivery_mode(if durable { 2 } else { 1 })
            .with_priority(message.priority)
            .with_message_id(message.message_id.clone().into())
            .with_content_type("application/json".into());

        let confirm = session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &payload,
                properties,
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;

        let confirmation = confirm
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("消息发布确认失败: {e}")))?;

        if confirmation.is_nack() {
            return Err(SchedulerError::MessageQueue(format!(
                "RabbitMQ拒绝了发往队列 {queue} 的消息"
            )));
        }
        if confirmation.take_message().is_some() {
            return Err(SchedulerError::MessageQueue(format!(
                "消息无法路由到队列 {queue}"
            )));
        }

        debug!(queue = %queue, task_id = message.task_id, "消息已发布");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> SchedulerResult<mpsc::Receiver<Delivery>> {
        let consumer = self
            .inner
            .open_consumer(queue, consumer_tag, prefetch_count)
            .await?;

        let (tx, rx) = mpsc::channel(prefetch_count.max(1) as usize);
        tokio::spawn(self.inner.clone().forward(
            queue.to_string(),
            consumer_tag.to_string(),
            prefetch_count,
            consumer,
            tx,
        ));
        Ok(rx)
    }

    async fn queue_info(&self, queue: &str) -> SchedulerResult<QueueInfo> {
        let session = self.inner.session().await?;

        // 被动声明失败会关闭通道，使用临时通道查询
        let channel = session
            .connection
            .create_channel()
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建通道失败: {e}")))?;

        let result = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        let info = match result {
            Ok(declared) => QueueInfo {
                name: queue.to_string(),
                message_count: declared.message_count(),
                consumer_count: declared.consumer_count(),
            },
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("NOT_FOUND") || error_msg.contains("404") {
                    debug!("队列 {} 不存在，返回大小为0", queue);
                    QueueInfo {
                        name: queue.to_string(),
                        message_count: 0,
                        consumer_count: 0,
                    }
                } else {
                    return Err(SchedulerError::MessageQueue(format!(
                        "获取队列 {queue} 信息失败: {e}"
                    )));
                }
            }
        };

        if channel.status().connected() {
            let _ = channel.close(200, "查询完成").await;
        }

        Ok(info)
    }

    async fn close(&self) -> SchedulerResult<()> {
        self.inner.shutdown.cancel();
        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            if session.connection.status().connected() {
                session
                    .connection
                    .close(200, "正常关闭")
                    .await
                    .map_err(|e| SchedulerError::MessageQueue(format!("关闭连接失败: {e}")))?;
            }
        }

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}
