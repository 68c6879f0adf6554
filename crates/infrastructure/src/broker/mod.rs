pub mod in_memory;
pub mod rabbitmq;

pub use in_memory::InMemoryBroker;
pub use rabbitmq::RabbitMqBroker;

use std::sync::Arc;

use scheduler_core::{
    config::{BrokerConfig, BrokerKind},
    traits::MessageBroker,
    SchedulerResult,
};
use tracing::{debug, info};

/// 根据配置创建消息队列实现并完成连接
pub async fn create_broker(config: &BrokerConfig) -> SchedulerResult<Arc<dyn MessageBroker>> {
    debug!("Creating message broker with kind: {:?}", config.kind);

    let broker: Arc<dyn MessageBroker> = match config.kind {
        BrokerKind::Rabbitmq => {
            info!("Initializing RabbitMQ message broker");
            Arc::new(RabbitMqBroker::new(config.clone()))
        }
        BrokerKind::InMemory => {
            info!("Initializing in-memory message broker");
            Arc::new(InMemoryBroker::new())
        }
    };

    broker.connect().await?;
    Ok(broker)
}

/// 声明所有任务类型的共享队列
pub async fn declare_task_queues(
    broker: &dyn MessageBroker,
    config: &BrokerConfig,
) -> SchedulerResult<()> {
    for queue in config.task_queues() {
        broker.declare_queue(&queue, true).await?;
    }
    info!("所有任务队列初始化完成");
    Ok(())
}
