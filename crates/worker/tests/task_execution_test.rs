mod common;

use std::time::Duration;

use common::{handlers_for, Behavior, Harness, ScriptedHandler};
use scheduler_core::{
    models::{TaskKind, TaskMessage, TaskStatus, WorkerRegistration},
    traits::TaskStore,
};
use scheduler_worker::DeliveryOutcome;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn register(h: &Harness, worker_id: &str) {
    h.registry
        .register(WorkerRegistration {
            worker_id: worker_id.to_string(),
            host: "10.0.0.7".to_string(),
            port: 8001,
            max_concurrent_tasks: 4,
            capabilities: TaskKind::all().to_vec(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_successful_execution_completes_task_and_acks() {
    let h = Harness::new().await;
    register(&h, "w1").await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Diagnosis], handler.clone()), TIMEOUT);

    let task = h.add_task("camera-01 诊断", TaskKind::Diagnosis).await;
    h.publish_task(&task).await;

    let delivery = h.next_delivery(TaskKind::Diagnosis).await;
    let outcome = exec.process_delivery(delivery).await;
    assert_eq!(outcome, DeliveryOutcome::Completed);

    let stored = h.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.assigned_worker.as_deref(), Some("w1"));
    assert_eq!(stored.total_runs, 1);
    assert_eq!(stored.success_runs, 1);
    let result = stored.result.expect("结果应已写入");
    assert_eq!(result["status"], "normal");

    assert!(h.queued(TaskKind::Diagnosis).is_empty());
    assert_eq!(handler.calls(), 1);

    let worker = h.registry.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.successful_tasks, 1);
    assert_eq!(worker.total_tasks_processed, 1);
}

#[tokio::test]
async fn test_handler_error_fails_task_without_requeue() {
    let h = Harness::new().await;
    register(&h, "w1").await;
    let handler = ScriptedHandler::new(Behavior::Fail("模型加载失败".to_string()));
    let exec = h.execution("w1", handlers_for(&[TaskKind::Event], handler), TIMEOUT);

    let task = h.add_task("越线检测", TaskKind::Event).await;
    h.publish_task(&task).await;

    let outcome = exec
        .process_delivery(h.next_delivery(TaskKind::Event).await)
        .await;
    assert_eq!(outcome, DeliveryOutcome::Failed);

    let stored = h.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().contains("模型加载失败"));
    assert_eq!(stored.success_runs, 0);
    assert!(h.queued(TaskKind::Event).is_empty());

    let worker = h.registry.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.failed_tasks, 1);
}

#[tokio::test]
async fn test_duplicate_delivery_runs_task_once() {
    let h = Harness::new().await;
    register(&h, "w1").await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Diagnosis], handler.clone()), TIMEOUT);

    let task = h.add_task("重复投递", TaskKind::Diagnosis).await;
    h.publish_task(&task).await;
    h.publish_task(&task).await;

    let first = exec
        .process_delivery(h.next_delivery(TaskKind::Diagnosis).await)
        .await;
    let second = exec
        .process_delivery(h.next_delivery(TaskKind::Diagnosis).await)
        .await;

    assert_eq!(first, DeliveryOutcome::Completed);
    assert_eq!(second, DeliveryOutcome::ClaimLost);
    assert_eq!(handler.calls(), 1);
    assert_eq!(h.task(task.id).await.total_runs, 1);
    assert!(h.queued(TaskKind::Diagnosis).is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_have_single_winner() {
    let h = Harness::new().await;
    register(&h, "w1").await;
    register(&h, "w2").await;
    let handler = ScriptedHandler::new(Behavior::Sleep(Duration::from_millis(50)));
    let kinds = [TaskKind::Diagnosis];
    let w1 = h.execution("w1", handlers_for(&kinds, handler.clone()), TIMEOUT);
    let w2 = h.execution("w2", handlers_for(&kinds, handler.clone()), TIMEOUT);

    let task = h.add_task("竞争认领", TaskKind::Diagnosis).await;
    h.publish_task(&task).await;
    h.publish_task(&task).await;

    let d1 = h.next_delivery(TaskKind::Diagnosis).await;
    let d2 = h.next_delivery(TaskKind::Diagnosis).await;
    let (o1, o2) = tokio::join!(w1.process_delivery(d1), w2.process_delivery(d2));

    let outcomes = [o1, o2];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == DeliveryOutcome::Completed)
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == DeliveryOutcome::ClaimLost)
            .count(),
        1
    );
    assert_eq!(handler.calls(), 1);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_message_for_other_worker_is_acked_unprocessed() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Event], handler.clone()), TIMEOUT);

    let task = h.add_task("定向派发", TaskKind::Event).await;
    h.publish(&TaskMessage::new(task.id, task.kind, h.now()).targeted("w9"))
        .await;

    let outcome = exec
        .process_delivery(h.next_delivery(TaskKind::Event).await)
        .await;
    assert_eq!(outcome, DeliveryOutcome::ClaimLost);
    assert_eq!(handler.calls(), 0);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Pending);
    assert!(h.queued(TaskKind::Event).is_empty());
}

#[tokio::test]
async fn test_unsupported_kind_requeued_once_then_rejected() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Event], handler.clone()), TIMEOUT);

    let task = h.add_task("巡检", TaskKind::Maintenance).await;
    h.publish_task(&task).await;

    let first = exec
        .process_delivery(h.next_delivery(TaskKind::Maintenance).await)
        .await;
    assert_eq!(first, DeliveryOutcome::Requeued);
    assert_eq!(h.queued(TaskKind::Maintenance).len(), 1);

    let redelivered = h.next_delivery(TaskKind::Maintenance).await;
    assert!(redelivered.redelivered);
    let second = exec.process_delivery(redelivered).await;
    assert_eq!(second, DeliveryOutcome::Rejected);
    assert!(h.queued(TaskKind::Maintenance).is_empty());

    assert_eq!(handler.calls(), 0);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_missing_or_non_pending_task_is_acked() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::Succeed);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Event], handler.clone()), TIMEOUT);

    h.publish(&TaskMessage::new(4242, TaskKind::Event, h.now()))
        .await;
    let outcome = exec
        .process_delivery(h.next_delivery(TaskKind::Event).await)
        .await;
    assert_eq!(outcome, DeliveryOutcome::ClaimLost);

    let task = h.add_task("已取消", TaskKind::Event).await;
    h.tasks.cancel_pending(task.id, "人工取消").await.unwrap();
    h.publish_task(&task).await;
    let outcome = exec
        .process_delivery(h.next_delivery(TaskKind::Event).await)
        .await;
    assert_eq!(outcome, DeliveryOutcome::ClaimLost);

    assert_eq!(handler.calls(), 0);
    assert_eq!(exec.stats().claims_lost.load(std::sync::atomic::Ordering::Relaxed), 2);
    assert!(h.queued(TaskKind::Event).is_empty());
}

#[tokio::test]
async fn test_execution_timeout_marks_task_failed() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::Sleep(Duration::from_secs(30)));
    let exec = h.execution(
        "w1",
        handlers_for(&[TaskKind::Diagnosis], handler),
        Duration::from_millis(100),
    );

    let task = h.add_task("长时间诊断", TaskKind::Diagnosis).await;
    h.publish_task(&task).await;

    let outcome = exec
        .process_delivery(h.next_delivery(TaskKind::Diagnosis).await)
        .await;
    assert_eq!(outcome, DeliveryOutcome::Failed);

    let stored = h.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().contains("超时"));
    assert_eq!(exec.current_task_count().await, 0);
}

#[tokio::test]
async fn test_handler_panic_marks_task_failed() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::Panic);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Event], handler), TIMEOUT);

    let task = h.add_task("崩溃", TaskKind::Event).await;
    h.publish_task(&task).await;

    let outcome = exec
        .process_delivery(h.next_delivery(TaskKind::Event).await)
        .await;
    assert_eq!(outcome, DeliveryOutcome::Failed);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Failed);
    assert!(h.queued(TaskKind::Event).is_empty());
}

#[tokio::test]
async fn test_cancel_running_task() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::WaitForCancel);
    let exec = h.execution("w1", handlers_for(&[TaskKind::Event], handler.clone()), TIMEOUT);

    let task = h.add_task("可取消", TaskKind::Event).await;
    h.publish_task(&task).await;
    let delivery = h.next_delivery(TaskKind::Event).await;

    let running = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.process_delivery(delivery).await })
    };

    h.wait_for_status(task.id, TaskStatus::Running).await;
    while exec.running_task_ids().await.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!exec.cancel_task(9999).await);
    assert!(exec.cancel_task(task.id).await);

    assert_eq!(running.await.unwrap(), DeliveryOutcome::Failed);
    let stored = h.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().contains("取消"));
}

#[tokio::test]
async fn test_result_discarded_after_task_was_recovered() {
    let h = Harness::new().await;
    let handler = ScriptedHandler::new(Behavior::Sleep(Duration::from_millis(200)));
    let exec = h.execution("w1", handlers_for(&[TaskKind::Diagnosis], handler), TIMEOUT);

    let task = h.add_task("被回收", TaskKind::Diagnosis).await;
    h.publish_task(&task).await;
    let delivery = h.next_delivery(TaskKind::Diagnosis).await;

    let running = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.process_delivery(delivery).await })
    };

    h.wait_for_status(task.id, TaskStatus::Running).await;
    assert!(h
        .tasks
        .reset_to_pending(task.id, Some("w1"), "Worker心跳超时")
        .await
        .unwrap());

    assert_eq!(running.await.unwrap(), DeliveryOutcome::Completed);

    // 回收后的状态不会被原持有者的迟到结果覆盖
    let stored = h.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.recovery_count, 1);
    assert_eq!(stored.result, None);
}
