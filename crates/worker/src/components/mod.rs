pub mod consumer;
pub mod heartbeat_manager;
pub mod task_execution;

pub use consumer::QueueConsumer;
pub use heartbeat_manager::HeartbeatManager;
pub use task_execution::{DeliveryOutcome, ExecutionStats, TaskExecutionManager};
