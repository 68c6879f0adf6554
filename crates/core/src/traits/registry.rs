use async_trait::async_trait;

use crate::{
    models::{HeartbeatAck, RegistrationOutcome, WorkerHeartbeat, WorkerRegistration},
    SchedulerResult,
};

/// Worker进程访问注册中心所需的接口
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register(&self, registration: WorkerRegistration)
        -> SchedulerResult<RegistrationOutcome>;

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> SchedulerResult<HeartbeatAck>;

    async fn deregister(&self, worker_id: String) -> SchedulerResult<()>;

    async fn record_outcome(&self, worker_id: String, success: bool) -> SchedulerResult<()>;
}
