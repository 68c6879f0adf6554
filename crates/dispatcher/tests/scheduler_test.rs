mod common;

use std::sync::Arc;

use chrono::Duration;
use common::Harness;
use scheduler_core::{
    models::{Priority, Schedule, TaskKind, TaskOutcome, TaskStatus, WorkerStatus},
    traits::{MessageBroker, MockMessageBroker, TaskStore},
    BrokerConfig, SchedulerError,
};
use scheduler_dispatcher::{CancelOutcome, DispatchOutcome, TriggerOutcome};
use scheduler_infrastructure::InMemoryBroker;

#[cfg(test)]
mod scheduler_tests {
    use super::*;

    #[tokio::test]
    async fn test_interval_task_enqueued_once_per_interval() {
        let h = Harness::new().await;
        let task = h
            .add_task("摄像头巡检", TaskKind::Diagnosis, Schedule::Interval { minutes: 10 })
            .await;

        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(h.queued(TaskKind::Diagnosis).len(), 1);

        let stored = h.task(task.id).await;
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.next_run_time, Some(h.now() + Duration::minutes(10)));

        // 同一时刻再次扫描不会重复入队
        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.enqueued, 0);
        assert_eq!(h.queued(TaskKind::Diagnosis).len(), 1);

        h.clock.advance(Duration::minutes(9));
        assert_eq!(h.scheduler.enqueue_eligible_tasks().await.unwrap().enqueued, 0);

        h.clock.advance(Duration::minutes(1));
        assert_eq!(h.scheduler.enqueue_eligible_tasks().await.unwrap().enqueued, 1);
        assert_eq!(h.queued(TaskKind::Diagnosis).len(), 2);
    }

    #[tokio::test]
    async fn test_completed_task_is_rearmed_and_routed_by_kind() {
        let h = Harness::new().await;
        let task = h
            .add_task("事件检测", TaskKind::Event, Schedule::Interval { minutes: 5 })
            .await;
        h.scheduler.enqueue_eligible_tasks().await.unwrap();

        let now = h.now();
        assert!(h.tasks.conditional_claim(task.id, "w1", now).await.unwrap());
        assert!(h
            .tasks
            .update_terminal(
                task.id,
                "w1",
                &TaskOutcome::Completed {
                    result: serde_json::json!({"score": 0.9})
                },
                now
            )
            .await
            .unwrap());

        h.clock.advance(Duration::minutes(5));
        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(h.task(task.id).await.status, TaskStatus::Pending);
        assert_eq!(h.queued(TaskKind::Event).len(), 2);
        assert!(h.queued(TaskKind::Diagnosis).is_empty());
    }

    #[tokio::test]
    async fn test_running_cancelled_and_manual_tasks_are_not_enqueued() {
        let h = Harness::new().await;
        let running = h
            .add_task("运行中", TaskKind::Diagnosis, Schedule::Interval { minutes: 1 })
            .await;
        h.mark_running(running.id, "w1", Duration::minutes(5)).await;

        let cancelled = h
            .add_task("已取消", TaskKind::Diagnosis, Schedule::Interval { minutes: 1 })
            .await;
        h.edit(cancelled.id, |t| t.status = TaskStatus::Cancelled).await;

        h.add_task("手动", TaskKind::Diagnosis, Schedule::Manual).await;

        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.enqueued, 0);
        assert!(h.queued(TaskKind::Diagnosis).is_empty());
        assert_eq!(h.task(running.id).await.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_once_task_guarded_against_republish() {
        let h = Harness::new().await;
        let task = h.add_task("单次", TaskKind::Maintenance, Schedule::Once).await;

        assert_eq!(h.scheduler.enqueue_eligible_tasks().await.unwrap().enqueued, 1);
        let stored = h.task(task.id).await;
        assert_eq!(stored.next_run_time, Some(h.now() + Duration::seconds(1800)));

        h.clock.advance(Duration::minutes(10));
        assert_eq!(h.scheduler.enqueue_eligible_tasks().await.unwrap().enqueued, 0);

        // 执行完成后不再入队
        let now = h.now();
        assert!(h.tasks.conditional_claim(task.id, "w1", now).await.unwrap());
        h.tasks
            .update_terminal(
                task.id,
                "w1",
                &TaskOutcome::Completed {
                    result: serde_json::Value::Null,
                },
                now,
            )
            .await
            .unwrap();
        h.clock.advance(Duration::hours(2));
        assert_eq!(h.scheduler.enqueue_eligible_tasks().await.unwrap().enqueued, 0);
        assert_eq!(h.queued(TaskKind::Maintenance).len(), 1);
    }

    #[tokio::test]
    async fn test_overdue_task_gets_higher_priority() {
        let h = Harness::new().await;
        let task = h
            .add_task("积压", TaskKind::Diagnosis, Schedule::Interval { minutes: 5 })
            .await;
        let overdue = h.now() - Duration::minutes(90);
        h.edit(task.id, |t| t.next_run_time = Some(overdue)).await;

        h.scheduler.enqueue_eligible_tasks().await.unwrap();
        let messages = h.queued(TaskKind::Diagnosis);
        assert_eq!(messages[0].priority, 9);
        assert_eq!(messages[0].task_id, task.id);
    }

    #[tokio::test]
    async fn test_broker_outage_leaves_schedule_untouched() {
        let broker = Arc::new(InMemoryBroker::new());
        let h = Harness::with_broker(broker.clone(), broker.clone()).await;
        let task = h
            .add_task("断线", TaskKind::Diagnosis, Schedule::Interval { minutes: 10 })
            .await;

        broker.set_connected(false);
        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.enqueued, 0);
        assert_eq!(h.task(task.id).await.next_run_time, None);

        // 连接恢复后下一轮补发
        broker.set_connected(true);
        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(h.queued(TaskKind::Diagnosis).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_restores_previous_status() {
        let broker = Arc::new(InMemoryBroker::new());
        let h = Harness::with_broker(broker.clone(), broker.clone()).await;
        let periodic = h
            .add_task("周期任务", TaskKind::Diagnosis, Schedule::Interval { minutes: 10 })
            .await;
        h.edit(periodic.id, |t| {
            t.status = TaskStatus::Completed;
            t.assigned_worker = Some("w1".to_string());
        })
        .await;

        broker.set_connected(false);
        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.failed, 1);

        let task = h.task(periodic.id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_worker.as_deref(), Some("w1"));
        assert_eq!(task.next_run_time, None);

        broker.set_connected(true);
        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(h.task(periodic.id).await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_manual_publish_restores_previous_status() {
        let broker = Arc::new(InMemoryBroker::new());
        let h = Harness::with_broker(broker.clone(), broker.clone()).await;
        h.register_worker("w1", 2, vec![TaskKind::Event]).await;

        let failed = h.add_task("失败重试", TaskKind::Event, Schedule::Manual).await;
        h.edit(failed.id, |t| t.status = TaskStatus::Failed).await;
        let cancelled = h.add_task("已取消", TaskKind::Event, Schedule::Manual).await;
        h.edit(cancelled.id, |t| t.status = TaskStatus::Cancelled).await;

        broker.set_connected(false);
        assert!(h.scheduler.trigger_now(failed.id).await.is_err());
        assert_eq!(h.task(failed.id).await.status, TaskStatus::Failed);

        assert!(h
            .scheduler
            .dispatch_to_worker(cancelled.id, "w1")
            .await
            .is_err());
        assert_eq!(h.task(cancelled.id).await.status, TaskStatus::Cancelled);

        broker.set_connected(true);
        assert_eq!(
            h.scheduler.trigger_now(failed.id).await.unwrap(),
            TriggerOutcome::Enqueued
        );
        assert_eq!(h.task(failed.id).await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_publish_rejection_from_mock_broker_counts_as_failure() {
        let mut mock = MockMessageBroker::new();
        mock.expect_publish()
            .times(1)
            .returning(|_, _, _| Err(SchedulerError::MessageQueue("未确认".to_string())));
        let observed = Arc::new(InMemoryBroker::new());
        let h = Harness::with_broker(observed, Arc::new(mock)).await;
        let task = h
            .add_task("拒绝", TaskKind::Event, Schedule::Interval { minutes: 3 })
            .await;

        let report = h.scheduler.enqueue_eligible_tasks().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.task(task.id).await.next_run_time, None);
    }

    #[tokio::test]
    async fn test_trigger_now() {
        let h = Harness::new().await;
        let manual = h.add_task("手动诊断", TaskKind::Diagnosis, Schedule::Manual).await;

        assert_eq!(
            h.scheduler.trigger_now(manual.id).await.unwrap(),
            TriggerOutcome::Enqueued
        );
        let messages = h.queued(TaskKind::Diagnosis);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].priority, Priority::MANUAL_TRIGGER);

        h.mark_running(manual.id, "w1", Duration::minutes(1)).await;
        assert_eq!(
            h.scheduler.trigger_now(manual.id).await.unwrap(),
            TriggerOutcome::AlreadyRunning
        );

        let inactive = h.add_task("停用", TaskKind::Diagnosis, Schedule::Manual).await;
        h.edit(inactive.id, |t| t.is_active = false).await;
        assert_eq!(
            h.scheduler.trigger_now(inactive.id).await.unwrap(),
            TriggerOutcome::Inactive
        );

        assert!(matches!(
            h.scheduler.trigger_now(999).await,
            Err(SchedulerError::TaskNotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_trigger_now_reactivates_cancelled_and_failed_tasks() {
        let h = Harness::new().await;
        let cancelled = h.add_task("已取消", TaskKind::Event, Schedule::Manual).await;
        h.edit(cancelled.id, |t| t.status = TaskStatus::Cancelled).await;
        let failed = h.add_task("失败重试", TaskKind::Event, Schedule::Manual).await;
        h.edit(failed.id, |t| t.status = TaskStatus::Failed).await;

        for id in [cancelled.id, failed.id] {
            assert_eq!(
                h.scheduler.trigger_now(id).await.unwrap(),
                TriggerOutcome::Enqueued
            );
            assert_eq!(h.task(id).await.status, TaskStatus::Pending);
        }
        assert_eq!(h.queued(TaskKind::Event).len(), 2);
    }

    #[tokio::test]
    async fn test_cancel() {
        let h = Harness::new().await;
        let pending = h.add_task("待执行", TaskKind::Diagnosis, Schedule::Manual).await;
        assert_eq!(
            h.scheduler.cancel(pending.id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(h.task(pending.id).await.status, TaskStatus::Cancelled);

        // 已取消的任务无法被认领
        let now = h.now();
        assert!(!h.tasks.conditional_claim(pending.id, "w1", now).await.unwrap());

        let running = h.add_task("执行中", TaskKind::Diagnosis, Schedule::Manual).await;
        h.mark_running(running.id, "w1", Duration::minutes(1)).await;
        assert_eq!(
            h.scheduler.cancel(running.id).await.unwrap(),
            CancelOutcome::RunningBestEffort
        );
        assert_eq!(h.task(running.id).await.status, TaskStatus::Running);

        let done = h.add_task("已完成", TaskKind::Diagnosis, Schedule::Manual).await;
        h.edit(done.id, |t| t.status = TaskStatus::Completed).await;
        assert_eq!(
            h.scheduler.cancel(done.id).await.unwrap(),
            CancelOutcome::NotCancellable
        );
    }

    #[tokio::test]
    async fn test_dispatch_refused_when_worker_at_capacity() {
        let h = Harness::new().await;
        h.register_worker("w1", 3, vec![TaskKind::Diagnosis]).await;
        h.clock.advance(Duration::seconds(5));
        h.heartbeat("w1", 3, WorkerStatus::Online).await;

        assert!(!h.registry.is_available("w1").await.unwrap());

        let task = h.add_task("第四个", TaskKind::Diagnosis, Schedule::Manual).await;
        let outcome = h.scheduler.dispatch_to_worker(task.id, "w1").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Refused(_)));
        assert!(h
            .broker
            .pending_messages(&BrokerConfig::direct_queue("w1"))
            .is_empty());

        h.clock.advance(Duration::seconds(5));
        h.heartbeat("w1", 1, WorkerStatus::Online).await;
        assert_eq!(
            h.scheduler.dispatch_to_worker(task.id, "w1").await.unwrap(),
            DispatchOutcome::Dispatched
        );
        let direct = h.broker.pending_messages(&BrokerConfig::direct_queue("w1"));
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].target_worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_dispatch_refused_for_unknown_worker_or_missing_capability() {
        let h = Harness::new().await;
        h.register_worker("w-event", 2, vec![TaskKind::Event]).await;
        let task = h.add_task("诊断", TaskKind::Diagnosis, Schedule::Manual).await;

        assert!(matches!(
            h.scheduler.dispatch_to_worker(task.id, "w-event").await.unwrap(),
            DispatchOutcome::Refused(_)
        ));
        assert!(matches!(
            h.scheduler.dispatch_to_worker(task.id, "nobody").await.unwrap(),
            DispatchOutcome::Refused(_)
        ));
    }

    #[tokio::test]
    async fn test_queue_status_reports_depth() {
        let h = Harness::new().await;
        h.add_task("a", TaskKind::Diagnosis, Schedule::Interval { minutes: 1 })
            .await;
        h.add_task("b", TaskKind::Diagnosis, Schedule::Interval { minutes: 1 })
            .await;
        h.scheduler.enqueue_eligible_tasks().await.unwrap();

        let status = h.scheduler.queue_status().await;
        assert!(status.connected);
        assert_eq!(status.queues.len(), 3);
        let diagnosis = status
            .queues
            .iter()
            .find(|q| q.name == "diagnosis_tasks")
            .unwrap();
        assert_eq!(diagnosis.message_count, 2);

        h.broker.set_connected(false);
        assert!(!h.scheduler.queue_status().await.connected);
    }

    #[tokio::test]
    async fn test_declare_queues_is_idempotent() {
        let h = Harness::new().await;
        h.scheduler.declare_queues().await.unwrap();
        h.scheduler.declare_queues().await.unwrap();
        assert_eq!(h.broker.is_durable("event_tasks"), Some(true));
        assert!(h.broker.is_connected());
    }
}
