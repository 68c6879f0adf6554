use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{normalize_enum_text, TaskKind};
use crate::{SchedulerError, SchedulerResult};

/// Worker节点信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub max_concurrent_tasks: i32,
    pub current_tasks: i32,
    pub capabilities: Vec<TaskKind>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub total_tasks_processed: i64,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
}

/// Worker状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkerStatus {
    Online,
    Offline,
    Busy,
    Error,
    Maintenance,
}

impl WorkerStatus {
    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        match normalize_enum_text(raw).as_str() {
            "ONLINE" => Ok(WorkerStatus::Online),
            "OFFLINE" => Ok(WorkerStatus::Offline),
            "BUSY" => Ok(WorkerStatus::Busy),
            "ERROR" => Ok(WorkerStatus::Error),
            "MAINTENANCE" => Ok(WorkerStatus::Maintenance),
            _ => Err(SchedulerError::InvalidTaskStatus(format!(
                "未知的Worker状态: {raw}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "ONLINE",
            WorkerStatus::Offline => "OFFLINE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Error => "ERROR",
            WorkerStatus::Maintenance => "MAINTENANCE",
        }
    }

    /// 仍在发送心跳、其持有的任务不应被回收
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Online | WorkerStatus::Busy | WorkerStatus::Maintenance
        )
    }
}

impl FromStr for WorkerStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkerStatus {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, SchedulerError> {
        Self::parse(&value)
    }
}

impl From<WorkerStatus> for String {
    fn from(status: WorkerStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl_text_enum_sqlx!(WorkerStatus);

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub max_concurrent_tasks: i32,
    pub capabilities: Vec<TaskKind>,
}

/// Worker心跳信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub current_tasks: i32,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
}

/// 注册结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Rejected(String),
}

/// 心跳处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAck {
    Accepted,
    /// 时间戳早于已记录的心跳，被忽略
    Stale,
    /// Worker未注册，调用方需要重新注册
    UnknownWorker,
    Rejected(String),
}

impl Worker {
    /// 根据注册请求创建新的Worker信息
    pub fn new(registration: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: registration.worker_id,
            host: registration.host,
            port: registration.port,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_tasks: 0,
            capabilities: registration.capabilities,
            status: WorkerStatus::Online,
            last_heartbeat: now,
            registered_at: now,
            total_tasks_processed: 0,
            successful_tasks: 0,
            failed_tasks: 0,
        }
    }

    /// 在线且仍有空闲槽位
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Online && self.current_tasks < self.max_concurrent_tasks
    }

    pub fn supports(&self, kind: TaskKind) -> bool {
        self.capabilities.contains(&kind)
    }

    /// 检查Worker是否可以接受指定类型的新任务
    pub fn can_accept(&self, kind: TaskKind) -> bool {
        self.is_available() && self.supports(kind)
    }

    /// 获取Worker负载率
    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_tasks <= 0 {
            0.0
        } else {
            (self.current_tasks as f64 / self.max_concurrent_tasks as f64) * 100.0
        }
    }

    /// 成功率（百分比），尚未处理任务时视为 100
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks_processed == 0 {
            100.0
        } else {
            (self.successful_tasks as f64 / self.total_tasks_processed as f64) * 100.0
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }
}
