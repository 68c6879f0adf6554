pub mod app_config;
pub mod broker;
pub mod database;
pub mod dispatcher_worker;

pub use app_config::{ApiConfig, AppConfig};
pub use broker::{BrokerConfig, BrokerKind};
pub use database::DatabaseConfig;
pub use dispatcher_worker::{DispatcherConfig, HandlerEndpoints, RegistryConfig, WorkerConfig};
