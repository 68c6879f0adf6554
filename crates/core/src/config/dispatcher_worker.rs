use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::TaskKind;

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 入队扫描间隔
    pub schedule_interval_seconds: u64,
    /// 卡死任务扫描间隔
    pub recovery_interval_seconds: u64,
    /// RUNNING 超过该时长即视为卡死
    pub stuck_threshold_seconds: i64,
    /// 单个任务被回收的最大次数，超过后置为 FAILED
    pub max_recovery_attempts: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_interval_seconds: 30,
            recovery_interval_seconds: 60,
            stuck_threshold_seconds: 1800,
            max_recovery_attempts: 3,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.schedule_interval_seconds == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.recovery_interval_seconds == 0 {
            return Err(anyhow::anyhow!("恢复扫描间隔必须大于0"));
        }

        if self.stuck_threshold_seconds <= 0 {
            return Err(anyhow::anyhow!("卡死阈值必须大于0"));
        }

        if self.max_recovery_attempts <= 0 {
            return Err(anyhow::anyhow!("最大恢复次数必须大于0"));
        }

        Ok(())
    }
}

/// 注册中心配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_timeout_seconds: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            sweep_interval_seconds: 30,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳扫描间隔必须大于0"));
        }

        Ok(())
    }
}

/// 外部执行服务地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerEndpoints {
    pub diagnosis: Option<String>,
    pub event: Option<String>,
    pub maintenance: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for HandlerEndpoints {
    fn default() -> Self {
        Self {
            diagnosis: None,
            event: None,
            maintenance: None,
            request_timeout_seconds: 300,
        }
    }
}

impl HandlerEndpoints {
    pub fn endpoint_for(&self, kind: TaskKind) -> Option<&str> {
        match kind {
            TaskKind::Diagnosis => self.diagnosis.as_deref(),
            TaskKind::Event => self.event.as_deref(),
            TaskKind::Maintenance => self.maintenance.as_deref(),
        }
    }
}

/// Worker配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 为空时启动时生成 `worker-{hostname}-{随机后缀}`
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub max_concurrent_tasks: i32,
    pub capabilities: Vec<TaskKind>,
    pub heartbeat_interval_seconds: u64,
    pub task_timeout_seconds: u64,
    pub drain_timeout_seconds: u64,
    pub status_update_retries: u32,
    pub handlers: HandlerEndpoints,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_id: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8001,
            max_concurrent_tasks: 12,
            capabilities: TaskKind::all().to_vec(),
            heartbeat_interval_seconds: 30,
            task_timeout_seconds: 1800,
            drain_timeout_seconds: 30,
            status_update_retries: 3,
            handlers: HandlerEndpoints::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("主机地址不能为空"));
        }

        if self.max_concurrent_tasks <= 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.max_concurrent_tasks > u16::MAX as i32 {
            return Err(anyhow::anyhow!(
                "最大并发任务数过大: {}",
                self.max_concurrent_tasks
            ));
        }

        if self.capabilities.is_empty() {
            return Err(anyhow::anyhow!("支持的任务类型不能为空"));
        }

        let unique: HashSet<_> = self.capabilities.iter().collect();
        if unique.len() != self.capabilities.len() {
            return Err(anyhow::anyhow!("支持的任务类型存在重复"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        if self.handlers.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("执行服务请求超时时间必须大于0"));
        }

        Ok(())
    }
}
