pub mod task_store;
pub mod worker_store;

pub use task_store::PostgresTaskStore;
pub use worker_store::PostgresWorkerStore;
