pub mod message_broker;
pub mod registry;
pub mod task_handler;
pub mod task_store;
pub mod time;
pub mod worker_store;

pub use message_broker::*;
pub use registry::*;
pub use task_handler::*;
pub use task_store::*;
pub use time::*;
pub use worker_store::*;
