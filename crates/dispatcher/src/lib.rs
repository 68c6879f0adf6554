//! 调度端
//!
//! 周期性地把到期任务发布到队列、回收卡死任务，并维护Worker注册信息。

pub mod cron_utils;
pub mod recovery_service;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod service;

pub use cron_utils::CronScheduler;
pub use recovery_service::{classify_stuck, RecoveryReason, RecoveryReport, RecoveryService};
pub use registry::{DispatchDecision, WorkerRegistry};
pub use schedule::{calculate_priority, evaluate_schedule, next_run_after};
pub use scheduler::{
    CancelOutcome, DispatchOutcome, EnqueueReport, QueueStatus, TaskScheduler, TriggerOutcome,
};
pub use service::DispatcherService;
