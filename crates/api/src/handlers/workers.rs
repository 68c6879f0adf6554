use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::models::{Worker, WorkerStatus};

use crate::{
    error::{ApiError, ApiResult},
    routes::ApiState,
};

/// Worker查询参数
#[derive(Debug, Deserialize)]
pub struct WorkerQueryParams {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_tasks: i32,
    pub max_concurrent_tasks: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub load_percentage: f64,
    pub success_rate: f64,
}

impl From<&Worker> for WorkerView {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.worker_id.clone(),
            status: worker.status,
            current_tasks: worker.current_tasks,
            max_concurrent_tasks: worker.max_concurrent_tasks,
            last_heartbeat: worker.last_heartbeat,
            load_percentage: worker.load_percentage(),
            success_rate: worker.success_rate(),
        }
    }
}

/// 获取Worker列表，可按状态过滤
pub async fn list_workers(
    State(state): State<ApiState>,
    Query(params): Query<WorkerQueryParams>,
) -> ApiResult<Json<Vec<WorkerView>>> {
    let filter = params
        .status
        .as_deref()
        .map(WorkerStatus::parse)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let workers = state.registry.list_workers().await?;
    Ok(Json(
        workers
            .iter()
            .filter(|w| filter.is_none_or(|status| w.status == status))
            .map(WorkerView::from)
            .collect(),
    ))
}
