pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use models::{
    HeartbeatAck, Priority, RegistrationOutcome, Schedule, ScheduleType, Task, TaskKind,
    TaskMessage, TaskOutcome, TaskStatus, Worker, WorkerHeartbeat, WorkerRegistration,
    WorkerStatus,
};
pub use traits::*;
