//! # Scheduler API
//!
//! 只读的管理接口，暴露调度内部状态的投影，不包含任何控制逻辑。
//!
//! - `GET /health` - 存活检查
//! - `GET /api/status` - 消息队列连接状态、队列深度、消费者数量和卡死任务数
//! - `GET /api/workers` - Worker列表（可选 `?status=ONLINE` 过滤）

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, ApiState};

/// 创建完整的API应用
pub fn create_app(state: ApiState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
