use axum::{extract::State, Json};
use serde::Serialize;

use crate::{error::ApiResult, routes::ApiState};

#[derive(Debug, Serialize)]
pub struct QueueView {
    pub name: String,
    pub queue_depth: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub connected: bool,
    pub queues: Vec<QueueView>,
    pub stuck_tasks: usize,
}

/// 消息队列连接状态、各队列深度以及超过卡死阈值的任务数
pub async fn get_status(State(state): State<ApiState>) -> ApiResult<Json<StatusView>> {
    let status = state.scheduler.queue_status().await;
    let stuck = state
        .task_store
        .fetch_stuck(state.scheduler.stuck_threshold(), state.clock.now())
        .await?;

    Ok(Json(StatusView {
        connected: status.connected,
        queues: status
            .queues
            .into_iter()
            .map(|q| QueueView {
                name: q.name,
                queue_depth: q.message_count,
                consumer_count: q.consumer_count,
            })
            .collect(),
        stuck_tasks: stuck.len(),
    }))
}
