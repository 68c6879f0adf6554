use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::normalize_enum_text;
use crate::{SchedulerError, SchedulerResult};

/// 任务定义
///
/// 表示系统中可调度执行的诊断、事件或维护任务。任务由外部管理操作创建，
/// 调度器只负责推进调度时间和 PENDING 状态，Worker 负责 RUNNING 及终态。
///
/// # 字段说明
///
/// - `kind`: 任务类型，同时也是执行该任务所需的 Worker 能力
/// - `schedule`: 调度描述（手动、单次、固定间隔、CRON）
/// - `is_active`: 为 false 的任务无论调度如何都不会入队
/// - `assigned_worker`: 当前持有该任务的 Worker，仅在 RUNNING 时有意义
/// - `last_run_time`: 最近一次被认领的时间，也是卡死检测的依据
/// - `next_run_time`: 下一次允许触发的时间，入队成功后推进
/// - `recovery_count`: 被卡死恢复扫描回收的次数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub kind: TaskKind,
    pub schedule: Schedule,
    pub status: TaskStatus,
    pub is_active: bool,
    pub parameters: serde_json::Value,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub total_runs: i64,
    pub success_runs: i64,
    pub recovery_count: i32,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 创建新任务
    pub fn new(name: impl Into<String>, kind: TaskKind, schedule: Schedule) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由存储层生成
            name: name.into(),
            kind,
            schedule,
            status: TaskStatus::Pending,
            is_active: true,
            parameters: serde_json::Value::Null,
            assigned_worker: None,
            started_at: None,
            last_run_time: None,
            next_run_time: None,
            total_runs: 0,
            success_runs: 0,
            recovery_count: 0,
            error_message: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 执行该任务所需的能力
    pub fn required_capability(&self) -> TaskKind {
        self.kind
    }

    /// 是否为手动触发的任务
    pub fn is_manual(&self) -> bool {
        matches!(self.schedule, Schedule::Manual)
    }

    /// 成功率（百分比），从未执行时返回 0
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            (self.success_runs as f64 / self.total_runs as f64) * 100.0
        }
    }
}

/// 任务状态
///
/// 状态的唯一内存表示。所有从存储读出的状态值都必须经过 [`TaskStatus::parse`]，
/// 不允许直接拿持久化的原始字符串和枚举常量比较。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 规范化解析：忽略大小写与首尾空白，兼容 `TaskStatus.RUNNING` 这类带类型前缀的写法
    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        match normalize_enum_text(raw).as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" | "CANCELED" => Ok(TaskStatus::Cancelled),
            _ => Err(SchedulerError::InvalidTaskStatus(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 周期调度可以从这些状态重新入队
    pub fn is_rearmable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Completed | TaskStatus::Failed
        )
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, SchedulerError> {
        Self::parse(&value)
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl_text_enum_sqlx!(TaskStatus);

/// 任务类型，同时也是 Worker 能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskKind {
    Diagnosis,
    Event,
    Maintenance,
}

impl TaskKind {
    pub fn all() -> [TaskKind; 3] {
        [TaskKind::Diagnosis, TaskKind::Event, TaskKind::Maintenance]
    }

    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        match normalize_enum_text(raw).as_str() {
            "DIAGNOSIS" => Ok(TaskKind::Diagnosis),
            "EVENT" => Ok(TaskKind::Event),
            "MAINTENANCE" => Ok(TaskKind::Maintenance),
            _ => Err(SchedulerError::InvalidTaskKind(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Diagnosis => "diagnosis",
            TaskKind::Event => "event",
            TaskKind::Maintenance => "maintenance",
        }
    }
}

impl FromStr for TaskKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskKind {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, SchedulerError> {
        Self::parse(&value)
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl_text_enum_sqlx!(TaskKind);

/// 调度类型（持久化列 `schedule_type`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Manual,
    Once,
    Interval,
    Cron,
}

impl ScheduleType {
    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        match normalize_enum_text(raw).as_str() {
            "MANUAL" => Ok(ScheduleType::Manual),
            "ONCE" => Ok(ScheduleType::Once),
            "INTERVAL" => Ok(ScheduleType::Interval),
            "CRON" => Ok(ScheduleType::Cron),
            _ => Err(SchedulerError::InvalidSchedule(format!(
                "未知的调度类型: {raw}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Manual => "manual",
            ScheduleType::Once => "once",
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
        }
    }
}

impl_text_enum_sqlx!(ScheduleType);

/// 调度描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// 只在外部显式触发时执行
    Manual,
    /// 只执行一次
    Once,
    /// 固定间隔（分钟）
    Interval { minutes: i64 },
    /// CRON 表达式
    Cron { expression: String },
}

impl Schedule {
    /// 间隔调度允许的最大分钟数（十年）
    pub const MAX_INTERVAL_MINUTES: i64 = 10 * 366 * 24 * 60;

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Schedule::Manual => ScheduleType::Manual,
            Schedule::Once => ScheduleType::Once,
            Schedule::Interval { .. } => ScheduleType::Interval,
            Schedule::Cron { .. } => ScheduleType::Cron,
        }
    }

    pub fn interval_minutes(&self) -> Option<i64> {
        match self {
            Schedule::Interval { minutes } => Some(*minutes),
            _ => None,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Schedule::Cron { expression } => Some(expression.as_str()),
            _ => None,
        }
    }

    /// 从持久化的三列重建调度描述
    pub fn from_parts(
        schedule_type: ScheduleType,
        interval_minutes: Option<i64>,
        cron_expression: Option<String>,
    ) -> SchedulerResult<Self> {
        match schedule_type {
            ScheduleType::Manual => Ok(Schedule::Manual),
            ScheduleType::Once => Ok(Schedule::Once),
            ScheduleType::Interval => match interval_minutes {
                Some(minutes) if (1..=Self::MAX_INTERVAL_MINUTES).contains(&minutes) => {
                    Ok(Schedule::Interval { minutes })
                }
                other => Err(SchedulerError::InvalidSchedule(format!(
                    "间隔调度缺少有效的间隔分钟数: {other:?}"
                ))),
            },
            ScheduleType::Cron => match cron_expression {
                Some(expression) if !expression.trim().is_empty() => {
                    Ok(Schedule::Cron { expression })
                }
                _ => Err(SchedulerError::InvalidSchedule(
                    "CRON调度缺少表达式".to_string(),
                )),
            },
        }
    }
}

/// 任务执行结果，由 Worker 写回存储
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed { result: serde_json::Value },
    Failed { error_message: String },
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_normalizes_representation() {
        assert_eq!(TaskStatus::parse("RUNNING").unwrap(), TaskStatus::Running);
        assert_eq!(TaskStatus::parse("running").unwrap(), TaskStatus::Running);
        assert_eq!(TaskStatus::parse(" Running \n").unwrap(), TaskStatus::Running);
        assert_eq!(
            TaskStatus::parse("TaskStatus.RUNNING").unwrap(),
            TaskStatus::Running
        );
        assert_eq!(TaskStatus::parse("canceled").unwrap(), TaskStatus::Cancelled);
        assert!(TaskStatus::parse("DONE").is_err());
        assert!(TaskStatus::parse("").is_err());
    }

    #[test]
    fn test_status_serde_goes_through_parse() {
        let status: TaskStatus = serde_json::from_str("\"taskstatus.pending\"").unwrap();
        assert_eq!(status, TaskStatus::Pending);
        assert_eq!(
            serde_json::to_string(&TaskStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        assert!(serde_json::from_str::<TaskStatus>("\"bogus\"").is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Failed.is_rearmable());
        assert!(!TaskStatus::Running.is_rearmable());
        assert!(!TaskStatus::Cancelled.is_rearmable());
    }

    #[test]
    fn test_kind_round_trip_text() {
        for kind in TaskKind::all() {
            assert_eq!(TaskKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert_eq!(TaskKind::parse("EVENT").unwrap(), TaskKind::Event);
        assert!(matches!(
            TaskKind::parse("ai_service"),
            Err(SchedulerError::InvalidTaskKind(raw)) if raw == "ai_service"
        ));
    }

    #[test]
    fn test_schedule_from_parts() {
        assert_eq!(
            Schedule::from_parts(ScheduleType::Interval, Some(15), None).unwrap(),
            Schedule::Interval { minutes: 15 }
        );
        assert!(Schedule::from_parts(ScheduleType::Interval, None, None).is_err());
        assert!(Schedule::from_parts(ScheduleType::Interval, Some(0), None).is_err());
        assert!(Schedule::from_parts(
            ScheduleType::Interval,
            Some(Schedule::MAX_INTERVAL_MINUTES + 1),
            None
        )
        .is_err());
        assert!(
            Schedule::from_parts(ScheduleType::Interval, Some(1_000_000_000_000), None).is_err()
        );
        assert!(Schedule::from_parts(ScheduleType::Cron, None, Some(" ".into())).is_err());
        assert_eq!(
            Schedule::from_parts(ScheduleType::Manual, Some(5), None).unwrap(),
            Schedule::Manual
        );
    }

    #[test]
    fn test_task_defaults() {
        let task = Task::new("亮度诊断", TaskKind::Diagnosis, Schedule::Manual);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.is_active);
        assert!(task.is_manual());
        assert_eq!(task.required_capability(), TaskKind::Diagnosis);
        assert_eq!(task.success_rate(), 0.0);
    }
}
