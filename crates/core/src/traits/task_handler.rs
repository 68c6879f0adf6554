//! 任务执行接口
//!
//! 任务体（图像诊断、事件检测等算法）对本层是黑盒：输入任务与配置，
//! 输出 `{score, status, message}`。每种任务类型在 Worker 启动时静态注册一个处理器，
//! 不在派发时按路径动态加载。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{models::Task, SchedulerResult};

/// 任务执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub worker_id: String,
    pub attempt: u32,
    /// 协作式取消信号，处理器应在安全点检查
    pub cancellation: CancellationToken,
}

/// 任务执行输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub score: Option<f64>,
    pub status: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn to_result_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// 任务处理器
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 执行任务体，返回错误即视为任务失败
    async fn execute(&self, ctx: TaskContext) -> SchedulerResult<TaskOutput>;

    fn name(&self) -> &str;
}
