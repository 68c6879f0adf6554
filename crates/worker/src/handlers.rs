use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use scheduler_core::{
    config::HandlerEndpoints,
    models::TaskKind,
    traits::{TaskContext, TaskHandler, TaskOutput},
    SchedulerError, SchedulerResult,
};

/// 任务类型到处理器的静态映射
///
/// Worker构建完成后不再变化，派发时只做查表。
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据配置的外部执行服务地址创建HTTP处理器
    pub fn from_endpoints(endpoints: &HandlerEndpoints) -> SchedulerResult<Self> {
        let mut registry = Self::new();
        let timeout = Duration::from_secs(endpoints.request_timeout_seconds);

        for kind in TaskKind::all() {
            if let Some(url) = endpoints.endpoint_for(kind) {
                let handler = HttpTaskHandler::new(kind, url, timeout)?;
                registry.register(kind, Arc::new(handler));
            }
        }

        Ok(registry)
    }

    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> &mut Self {
        if let Some(previous) = self.handlers.insert(kind, handler) {
            warn!("任务类型 {} 的处理器 {} 已被替换", kind, previous.name());
        }
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn supports(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn capabilities(&self) -> Vec<TaskKind> {
        self.handlers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct ExecutionRequest<'a> {
    task_id: i64,
    name: &'a str,
    kind: TaskKind,
    parameters: &'a serde_json::Value,
    worker_id: &'a str,
    attempt: u32,
}

/// 调用外部执行服务的处理器
///
/// 请求体为 `{task_id, name, kind, parameters, worker_id, attempt}`，
/// 期望返回 `{score, status, message}` 形式的JSON。
pub struct HttpTaskHandler {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTaskHandler {
    pub fn new(kind: TaskKind, endpoint: &str, timeout: Duration) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;

        info!("创建HTTP任务处理器: 类型={}, 地址={}", kind, endpoint);
        Ok(Self {
            name: format!("http-{kind}"),
            endpoint: endpoint.to_string(),
            client,
        })
    }

    async fn call(&self, ctx: &TaskContext) -> SchedulerResult<TaskOutput> {
        let request = ExecutionRequest {
            task_id: ctx.task.id,
            name: &ctx.task.name,
            kind: ctx.task.kind,
            parameters: &ctx.task.parameters,
            worker_id: &ctx.worker_id,
            attempt: ctx.attempt,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("请求执行服务失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::TaskExecution(format!(
                "执行服务返回错误状态 {}: {}",
                status.as_u16(),
                body
            )));
        }

        let output: TaskOutput = response
            .json()
            .await
            .map_err(|e| SchedulerError::Serialization(format!("解析执行结果失败: {e}")))?;
        debug!(
            "任务 {} 执行服务返回: score={:?}, status={:?}",
            ctx.task.id, output.score, output.status
        );
        Ok(output)
    }
}

#[async_trait]
impl TaskHandler for HttpTaskHandler {
    async fn execute(&self, ctx: TaskContext) -> SchedulerResult<TaskOutput> {
        let cancellation = ctx.cancellation.clone();
        tokio::select! {
            _ = cancellation.cancelled() => {
                Err(SchedulerError::TaskExecution("任务已被取消".to_string()))
            }
            result = self.call(&ctx) => result,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
