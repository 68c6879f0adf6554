pub mod components;
pub mod handlers;
pub mod service;

pub use components::{DeliveryOutcome, HeartbeatManager, QueueConsumer, TaskExecutionManager};
pub use handlers::{HandlerRegistry, HttpTaskHandler};
pub use service::{generate_worker_id, WorkerService, WorkerServiceBuilder, WorkerStats};
