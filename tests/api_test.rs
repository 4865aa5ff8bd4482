use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use fetchfleet::agent::MockAgent;
use fetchfleet::api::{API_KEY_HEADER, router, state::AppState};
use fetchfleet::config::Config;
use fetchfleet::dispatcher::Dispatcher;
use fetchfleet::observability::Metrics;
use fetchfleet::storage::MemoryBackend;

fn build_test_app(config: Config) -> Router {
    let config = Arc::new(config);
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        Arc::new(MemoryBackend::new()),
        Arc::new(MockAgent::new()),
        Arc::new(Metrics::new()),
    ));
    router(AppState::new(config, dispatcher))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap()
}

/// Sends a request and returns status plus parsed JSON body
async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = ServiceExt::<Request<Body>>::oneshot(app.clone(), request)
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, id: &str, slots: u32) -> Value {
    let (status, worker) = send(
        app,
        json_request(
            "POST",
            "/workers",
            json!({"id": id, "hostname": format!("{id}.local"), "port": 6800, "total_slots": slots}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    worker
}

async fn submit(app: &Router, url: &str) -> Value {
    let (status, task) = send(app, json_request("POST", "/tasks", json!({"url": url}))).await;
    assert_eq!(status, StatusCode::CREATED);
    task
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_app(Config::default());

    let (status, body) = send(&app, empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["storage"], "healthy");
}

#[tokio::test]
async fn test_create_task_without_workers_stays_pending() {
    let app = build_test_app(Config::default());

    let task = submit(&app, "https://example.com/file.iso").await;
    assert_eq!(task["status"], "pending");
    assert_eq!(task["priority"], "normal");
    assert!(task["worker_id"].is_null());

    let id = task["id"].as_str().unwrap();
    let (status, fetched) = send(&app, empty_request("GET", &format!("/tasks/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);
}

#[tokio::test]
async fn test_create_task_is_assigned_when_worker_available() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 2).await;

    let task = submit(&app, "https://example.com/file.iso").await;
    assert_eq!(task["status"], "assigned");
    assert_eq!(task["worker_id"], "worker-a");
    assert_eq!(task["engine_handle"], "gid-1");

    let (_, worker) = send(&app, empty_request("GET", "/workers/worker-a")).await;
    assert_eq!(worker["used_slots"], 1);
}

#[tokio::test]
async fn test_create_task_validation() {
    let app = build_test_app(Config::default());

    let (status, body) = send(&app, json_request("POST", "/tasks", json!({"url": "file:///etc/passwd"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYLOAD");

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/tasks",
            json!({"url": "https://example.com", "options": {"tags": ["video"]}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, json_request("POST", "/tasks", json!({"options": {}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn test_create_task_requires_json_content_type() {
    let app = build_test_app(Config::default());

    let request = Request::builder()
        .uri("/tasks")
        .method("POST")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"url": "https://example.com"}"#))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn test_payload_too_large() {
    let mut config = Config::default();
    config.server.max_payload_bytes = 64;
    let app = build_test_app(config);

    let long_url = format!("https://example.com/{}", "a".repeat(200));
    let (status, body) = send(&app, json_request("POST", "/tasks", json!({"url": long_url}))).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_list_tasks_with_status_filter() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 1).await;
    submit(&app, "https://example.com/1").await;
    submit(&app, "https://example.com/2").await;

    let (status, all) = send(&app, empty_request("GET", "/tasks")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, pending) = send(&app, empty_request("GET", "/tasks?status=pending")).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["url"], "https://example.com/2");

    let (status, body) = send(&app, empty_request("GET", "/tasks?status=queued")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_STATUS_FILTER");
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let app = build_test_app(Config::default());

    let (status, body) = send(&app, empty_request("GET", "/tasks/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(&app, empty_request("DELETE", "/tasks/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_then_stale_report() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 2).await;
    let task = submit(&app, "https://example.com/c.zip").await;
    let uri = format!("/tasks/{}", task["id"].as_str().unwrap());

    let (status, report) = send(
        &app,
        json_request(
            "PUT",
            &uri,
            json!({"worker_id": "worker-a", "status": "downloading", "progress": 40.0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outcome"], "applied");
    assert_eq!(report["task"]["status"], "downloading");

    let (status, cancelled) = send(&app, empty_request("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (status, report) = send(
        &app,
        json_request("PUT", &uri, json!({"worker_id": "worker-a", "progress": 90.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outcome"], "stale");
    assert_eq!(report["task"]["status"], "cancelled");

    // Cancelling a terminal task is a conflict
    let (status, body) = send(&app, empty_request("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_worker_failure_report_recycles_task() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 2).await;
    let task = submit(&app, "https://example.com/f.bin").await;
    let uri = format!("/tasks/{}", task["id"].as_str().unwrap());

    let (status, report) = send(
        &app,
        json_request(
            "PUT",
            &uri,
            json!({"worker_id": "worker-a", "status": "failed", "error_message": "disk full"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outcome"], "recycled");
    assert_eq!(report["task"]["status"], "pending");
    assert_eq!(report["task"]["retries"], 1);
    assert_eq!(report["task"]["error_message"], "disk full");
}

#[tokio::test]
async fn test_heartbeat_endpoint() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 4).await;

    let (status, worker) = send(&app, empty_request("POST", "/workers/worker-a/heartbeat")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(worker["status"], "online");

    let (status, worker) = send(
        &app,
        json_request(
            "POST",
            "/workers/worker-a/heartbeat",
            json!({"used_slots": 2, "health_metrics": {"cpu_percent": 35.0}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(worker["reported_slots"], 2);
    assert_eq!(worker["used_slots"], 0);

    let (status, body) = send(&app, empty_request("POST", "/workers/ghost/heartbeat")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UNKNOWN_WORKER");
}

#[tokio::test]
async fn test_worker_listing_and_removal() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 2).await;
    register(&app, "worker-b", 2).await;
    let task = submit(&app, "https://example.com/r.bin").await;
    assert_eq!(task["worker_id"], "worker-a");

    let (_, workers) = send(&app, empty_request("GET", "/workers?status=online")).await;
    assert_eq!(workers.as_array().unwrap().len(), 2);

    let (status, removed) = send(&app, empty_request("DELETE", "/workers/worker-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["tasks_recycled"], 1);

    let (status, _) = send(&app, empty_request("GET", "/workers/worker-a")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/tasks/{}", task["id"].as_str().unwrap());
    let (_, task) = send(&app, empty_request("GET", &uri)).await;
    assert_eq!(task["status"], "pending");
    assert_eq!(task["retries"], 1);
    assert_eq!(task["error_message"], "worker removed");

    let (status, body) = send(&app, empty_request("GET", "/workers?status=sleeping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_STATUS_FILTER");
}

#[tokio::test]
async fn test_status_summary() {
    let app = build_test_app(Config::default());
    register(&app, "worker-a", 2).await;
    submit(&app, "https://example.com/1").await;

    for uri in ["/status", "/api/status"] {
        let (status, summary) = send(&app, empty_request("GET", uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["strategy"], "least_loaded");
        assert_eq!(summary["active_workers"], 1);
        assert_eq!(summary["total_tasks"], 1);
        assert_eq!(summary["tasks_by_status"]["assigned"], 1);
        assert_eq!(summary["total_slots"], 2);
        assert_eq!(summary["used_slots"], 1);
        assert_eq!(summary["system_load"], 50.0);
        assert_eq!(summary["metrics"]["tasks_created"], 1);
    }
}

#[tokio::test]
async fn test_api_key_required() {
    let mut config = Config::default();
    config.security.api_key_required = true;
    config.security.api_keys = vec!["secret-key".to_string()];
    let app = build_test_app(config);

    let (status, body) = send(&app, empty_request("GET", "/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let wrong = Request::builder()
        .uri("/tasks")
        .header(API_KEY_HEADER, "guess")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/tasks")
        .header(API_KEY_HEADER, "secret-key")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, right).await;
    assert_eq!(status, StatusCode::OK);

    // Liveness stays open
    let (status, _) = send(&app, empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_required_keys_without_any_configured_admits_requests() {
    let mut config = Config::default();
    config.security.api_key_required = true;
    let app = build_test_app(config);

    let (status, _) = send(&app, empty_request("GET", "/status")).await;
    assert_eq!(status, StatusCode::OK);
}
