use std::sync::Arc;

use axum::{routing::get, Router};

use scheduler_core::traits::{TaskStore, TimeProvider};
use scheduler_dispatcher::{TaskScheduler, WorkerRegistry};

use crate::handlers::{health::health_check, system::get_status, workers::list_workers};

/// API应用状态
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<TaskScheduler>,
    pub registry: Arc<WorkerRegistry>,
    pub task_store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn TimeProvider>,
}

/// 创建API路由
pub fn create_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/workers", get(list_workers))
        .with_state(state)
}
