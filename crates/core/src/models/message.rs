use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskKind;
use crate::SchedulerResult;

/// 消息优先级
pub struct Priority;

impl Priority {
    pub const DEFAULT: u8 = 5;
    pub const MANUAL_TRIGGER: u8 = 8;
    /// 卡死恢复后重新入队的任务额外提升的优先级
    pub const RECOVERY_BOOST: u8 = 2;
    pub const MAX: u8 = 10;
}

/// 队列中传递的任务引用
///
/// 消息只携带任务 id 与类型，任务的权威状态始终以任务存储为准。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub message_id: String,
    pub task_id: i64,
    pub kind: TaskKind,
    pub enqueue_time: DateTime<Utc>,
    pub attempt_count: u32,
    pub priority: u8,
    /// 定向派发时的目标Worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_worker: Option<String>,
}

impl TaskMessage {
    pub fn new(task_id: i64, kind: TaskKind, enqueue_time: DateTime<Utc>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            task_id,
            kind,
            enqueue_time,
            attempt_count: 1,
            priority: Priority::DEFAULT,
            target_worker: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(Priority::MAX);
        self
    }

    pub fn with_attempt(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count.max(1);
        self
    }

    pub fn targeted(mut self, worker_id: impl Into<String>) -> Self {
        self.target_worker = Some(worker_id.into());
        self
    }

    pub fn to_bytes(&self) -> SchedulerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> SchedulerResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
