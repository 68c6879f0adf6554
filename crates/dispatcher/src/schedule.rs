//! 调度判定
//!
//! 纯函数：只依据任务自身的调度字段与给定的当前时间做判断，不访问存储。

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use scheduler_core::{Priority, Schedule, Task, TaskStatus};

use crate::cron_utils::CronScheduler;

/// 判断任务在 `now` 时刻是否应被周期调度入队
///
/// - 未启用、状态不可重新入队或手动调度的任务永远不会被周期调度选中
/// - 单次任务只在从未执行过时入队
/// - 间隔任务在 `max(next_run_time, last_run_time + 间隔)` 之后入队
/// - CRON 任务在下一次匹配时间到达后入队
pub fn evaluate_schedule(task: &Task, now: DateTime<Utc>) -> bool {
    if !task.is_active || !task.status.is_rearmable() {
        return false;
    }

    match &task.schedule {
        Schedule::Manual => false,
        Schedule::Once => {
            task.total_runs == 0 && task.next_run_time.map_or(true, |next| now >= next)
        }
        Schedule::Interval { minutes } => {
            let after_last = match task.last_run_time {
                Some(last) => match offset_minutes(last, *minutes) {
                    Some(after) => Some(after),
                    None => {
                        warn!("任务 {} 的间隔 {} 分钟超出时间范围，跳过调度", task.id, minutes);
                        return false;
                    }
                },
                None => None,
            };
            let due = match (task.next_run_time, after_last) {
                (Some(next), Some(after)) => Some(next.max(after)),
                (Some(next), None) => Some(next),
                (None, Some(after)) => Some(after),
                (None, None) => None,
            };
            due.map_or(true, |due| now >= due)
        }
        Schedule::Cron { expression } => {
            if let Some(next) = task.next_run_time {
                return now >= next;
            }

            let cron = match CronScheduler::new(expression) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!("任务 {} 的CRON表达式无效，跳过调度: {}", task.id, e);
                    return false;
                }
            };
            let base = task.last_run_time.unwrap_or(task.created_at);
            cron.should_trigger(base, now)
        }
    }
}

/// 入队成功后任务的下一次触发时间
pub fn next_run_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { minutes } => {
            let next = offset_minutes(now, *minutes);
            if next.is_none() {
                warn!("间隔 {} 分钟超出时间范围，无法计算下次执行时间", minutes);
            }
            next
        }
        Schedule::Cron { expression } => match CronScheduler::new(expression) {
            Ok(cron) => cron.next_execution_time(now),
            Err(e) => {
                warn!("无法计算CRON下次执行时间: {}", e);
                None
            }
        },
        Schedule::Manual | Schedule::Once => None,
    }
}

/// `base + minutes`，溢出时间范围时返回 `None`
fn offset_minutes(base: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    Duration::try_minutes(minutes).and_then(|delta| base.checked_add_signed(delta))
}

/// 根据任务的逾期时长计算消息优先级
pub fn calculate_priority(task: &Task, now: DateTime<Utc>) -> u8 {
    let overdue_minutes = task
        .next_run_time
        .map(|next| (now - next).num_minutes())
        .unwrap_or(0);

    let priority = match overdue_minutes {
        m if m > 60 => 9,
        m if m > 30 => 7,
        m if m > 10 => 6,
        _ => Priority::DEFAULT,
    };
    let boost = if task.status == TaskStatus::Pending && task.recovery_count > 0 {
        Priority::RECOVERY_BOOST
    } else {
        0
    };
    (priority + boost).min(Priority::MAX)
}
