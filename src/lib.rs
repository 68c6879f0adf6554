//! 诊断任务调度系统的进程装配：按运行模式启动调度端、Worker和管理接口。

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application, Components, RunningComponents};
pub use shutdown::ShutdownManager;
