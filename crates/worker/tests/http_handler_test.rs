use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use scheduler_core::{
    models::{Schedule, Task, TaskKind},
    traits::{TaskContext, TaskHandler},
    SchedulerError,
};
use scheduler_worker::HttpTaskHandler;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type Captured = Arc<Mutex<Vec<Value>>>;

async fn diagnose(State(captured): State<Captured>, Json(body): Json<Value>) -> Json<Value> {
    captured.lock().await.push(body);
    Json(json!({"score": 0.87, "status": "blurred", "message": "画面模糊"}))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "模型未加载")
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(10)).await;
    Json(json!({}))
}

async fn spawn_server() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/diagnose", post(diagnose))
        .route("/broken", post(broken))
        .route("/slow", post(slow))
        .with_state(captured.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), captured)
}

fn context(cancellation: CancellationToken) -> TaskContext {
    let mut task = Task::new("camera-12 画面诊断", TaskKind::Diagnosis, Schedule::Manual);
    task.id = 12;
    task.parameters = json!({"camera_id": "cam-12", "checks": ["blur", "occlusion"]});
    TaskContext {
        task,
        worker_id: "worker-http".to_string(),
        attempt: 2,
        cancellation,
    }
}

#[tokio::test]
async fn test_posts_task_and_parses_output() {
    let (base, captured) = spawn_server().await;
    let handler = HttpTaskHandler::new(
        TaskKind::Diagnosis,
        &format!("{base}/diagnose"),
        Duration::from_secs(5),
    )
    .unwrap();

    let output = handler
        .execute(context(CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(output.score, Some(0.87));
    assert_eq!(output.status.as_deref(), Some("blurred"));
    assert_eq!(output.message.as_deref(), Some("画面模糊"));

    let requests = captured.lock().await;
    assert_eq!(requests.len(), 1);
    let body = &requests[0];
    assert_eq!(body["task_id"], 12);
    assert_eq!(body["kind"], "diagnosis");
    assert_eq!(body["worker_id"], "worker-http");
    assert_eq!(body["attempt"], 2);
    assert_eq!(body["parameters"]["camera_id"], "cam-12");
}

#[tokio::test]
async fn test_error_status_is_task_failure() {
    let (base, _) = spawn_server().await;
    let handler = HttpTaskHandler::new(
        TaskKind::Diagnosis,
        &format!("{base}/broken"),
        Duration::from_secs(5),
    )
    .unwrap();

    let err = handler
        .execute(context(CancellationToken::new()))
        .await
        .unwrap_err();
    match err {
        SchedulerError::TaskExecution(message) => {
            assert!(message.contains("500"));
            assert!(message.contains("模型未加载"));
        }
        other => panic!("意外的错误类型: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_network_error() {
    let handler = HttpTaskHandler::new(
        TaskKind::Event,
        "http://127.0.0.1:1/detect",
        Duration::from_secs(2),
    )
    .unwrap();

    let err = handler
        .execute(context(CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Network(_)));
}

#[tokio::test]
async fn test_cancellation_interrupts_request() {
    let (base, _) = spawn_server().await;
    let handler = HttpTaskHandler::new(
        TaskKind::Diagnosis,
        &format!("{base}/slow"),
        Duration::from_secs(30),
    )
    .unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = handler.execute(context(token)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::TaskExecution(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
}
