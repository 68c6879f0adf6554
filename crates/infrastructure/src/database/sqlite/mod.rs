pub mod schema;
pub mod task_store;
pub mod worker_store;

pub use task_store::SqliteTaskStore;
pub use worker_store::SqliteWorkerStore;

use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};

/// SQLite 中时间统一存为 UTC 毫秒整数，保证比较按数值进行
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SchedulerError::DatabaseOperation(format!("无效的时间戳: {millis}")))
}

pub(crate) fn from_optional_millis(millis: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}
