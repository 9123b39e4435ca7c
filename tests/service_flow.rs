//! End-to-end flow: HTTP submission through worker completion.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use markup_sync::prelude::*;
use markup_sync::{QueueEvent, create_router};
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn wait_for_state(router: &Router, id: &str, state: &str) -> Value {
    for _ in 0..400 {
        let (status, job) = send(router, "GET", &format!("/api/queue/job/{id}"), None).await;
        if status == StatusCode::OK && job["state"] == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached {state}");
}

#[tokio::test]
async fn test_submitted_url_is_synced_by_worker() {
    let config = QueueConfig::default().with_retry_delay(Duration::from_millis(20));
    let queue = Queue::with_config(MemoryStore::new(), config);
    let mut events = queue.subscribe();
    let router = create_router(AppState::new(queue.clone()));

    let handler = |ctx: JobContext| async move {
        ctx.report_progress(50).await;
        if ctx.attempt() == 1 {
            return Err::<JobData, HandlerError>("first attempt flakes".into());
        }
        Ok(json!({ "synced": ctx.url() }))
    };
    let mut worker = Worker::with_config(
        queue.clone(),
        handler,
        WorkerConfig::default().with_poll_interval(Duration::from_millis(5)),
    );
    worker.start().await.unwrap();

    let (status, submitted) = send(
        &router,
        "POST",
        "/api/queue/jobs",
        Some(json!({"url": "https://example.com/thread/1", "delayMs": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = submitted["jobId"].as_str().unwrap().to_string();

    let job = wait_for_state(&router, &id, "completed").await;
    worker.stop().await.unwrap();

    assert_eq!(job["attemptsMade"], 2);
    assert_eq!(job["result"], json!({"synced": "https://example.com/thread/1"}));
    assert_eq!(job["progress"], 100);

    let (_, stats) = send(&router, "GET", "/api/queue/stats", None).await;
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["total"], 1);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
        if let QueueEvent::Retrying { attempts_made, max_attempts, .. } = event {
            assert_eq!((attempts_made, max_attempts), (1, 3));
        }
    }
    assert!(names.contains(&"retrying"));
    assert_eq!(names.last(), Some(&"completed"));
}

#[tokio::test]
async fn test_paused_queue_holds_jobs_until_resumed() {
    let queue = Queue::new(MemoryStore::new());
    let router = create_router(AppState::new(queue.clone()));
    let mut worker = Worker::with_config(
        queue.clone(),
        |_ctx: JobContext| async { Ok::<_, HandlerError>(json!(null)) },
        WorkerConfig::default().with_poll_interval(Duration::from_millis(5)),
    );
    worker.start().await.unwrap();

    send(&router, "POST", "/api/queue/pause", None).await;
    let (_, submitted) = send(
        &router,
        "POST",
        "/api/queue/jobs",
        Some(json!({"url": "https://example.com/thread/2", "delayMs": 0})),
    )
    .await;
    let id = submitted["jobId"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, listed) = send(&router, "GET", "/api/queue/jobs/waiting", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    send(&router, "POST", "/api/queue/resume", None).await;
    wait_for_state(&router, &id, "completed").await;
    worker.stop().await.unwrap();
}
