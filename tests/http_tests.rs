use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use querycron::app::AppState;
use querycron::config::LocalConfig;
use querycron::db::{create_pool_with, run_migrations};
use querycron::http::build_router;
use querycron::scheduler::executor::JobExecution;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tower::ServiceExt;

async fn setup_router() -> (ContainerAsync<Postgres>, TempDir, Router) {
    let (container, exports, _state, router) = setup_app().await;
    (container, exports, router)
}

async fn setup_app() -> (ContainerAsync<Postgres>, TempDir, Arc<AppState>, Router) {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start container");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let exports = TempDir::new().expect("Failed to create exports dir");

    let yaml = format!(
        r#"
database:
  host: localhost
  port: {}
  user: postgres
  password: postgres
  name: postgres
  ssl_mode: disable
server:
  log_file: querycron-test.log
exports:
  directory: {}
credentials:
  secret: test-secret
"#,
        port,
        exports.path().display()
    );
    let config = LocalConfig::from_yaml(&yaml).expect("Failed to parse config");
    let options = config.connect_options().expect("Failed to build connect options");
    let pool = create_pool_with(options)
        .await
        .expect("Failed to create pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let (state, _queue) = AppState::new(config, pool).expect("Failed to build app state");
    let state = Arc::new(state);
    let router = build_router(state.clone());
    (container, exports, state, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("Request failed");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("Failed to read body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("Failed to build request")
}

/// Reads the first server-sent event of a stream response, if one arrives
/// within `wait`.
async fn first_event(router: &Router, request: Request<Body>, wait: Duration) -> Option<String> {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut buffer = String::new();
    tokio::time::timeout(wait, async {
        while let Some(chunk) = body.next().await {
            let chunk = chunk.expect("Failed to read stream");
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            if let Some(end) = buffer.find("\n\n") {
                return Some(buffer[..end].to_string());
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

fn event_id(event: &str) -> u64 {
    event
        .lines()
        .find_map(|line| line.strip_prefix("id:"))
        .and_then(|id| id.trim().parse().ok())
        .expect("Event should carry an id")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("Failed to build request")
}

#[tokio::test]
async fn test_health() {
    let (_container, _exports, router) = setup_router().await;

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_job_crud_over_http() {
    let (_container, _exports, router) = setup_router().await;

    let (status, connection) = send(
        &router,
        post_json(
            "/connections",
            json!({
                "name": "scratch",
                "driver": "sqlite",
                "password": "hunter2",
                "database": ":memory:"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(connection.get("password").is_none());
    let connection_id = connection["id"].as_i64().expect("connection id");

    let (status, job) = send(
        &router,
        post_json(
            "/jobs",
            json!({
                "name": "daily",
                "query": "SELECT 1 AS id",
                "connectionId": connection_id,
                "schedule": { "type": "cron", "expression": "0 2 * * *" },
                "exportFlags": { "csv": true }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["scheduleStatus"], "valid");
    assert_eq!(job["schedule"]["timezone"], "UTC");
    let job_id = job["id"].as_i64().expect("job id");

    let (status, listed) = send(&router, get("/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, refused) = send(
        &router,
        post_json("/connections/delete", json!({ "id": connection_id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(refused["error"].is_string());

    let (status, deleted) = send(&router, post_json("/jobs/delete", json!({ "id": job_id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["deleted"], true);

    let (status, _) = send(&router, get(&format!("/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, post_json("/jobs/delete", json!({ "id": job_id }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let (_container, _exports, router) = setup_router().await;

    let (status, body) = send(
        &router,
        post_json(
            "/jobs",
            json!({ "name": "", "query": "SELECT 1", "connectionId": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap_or_default().contains("name"));

    let (status, _) = send(
        &router,
        post_json(
            "/jobs",
            json!({ "name": "orphan", "query": "SELECT 1", "connectionId": 999 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get("/stream/nonsense")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get("/stream/query-result:42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, get("/trackers/1/result/pdf")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get("/trackers/1/result/csv")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_trackers_snapshot_starts_empty() {
    let (_container, _exports, router) = setup_router().await;

    let (status, body) = send(&router, get("/trackers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trackers"], json!([]));
}

async fn create_job(router: &Router, query: &str) -> i64 {
    let (status, connection) = send(
        router,
        post_json(
            "/connections",
            json!({ "name": "scratch", "driver": "sqlite", "database": ":memory:" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, job) = send(
        router,
        post_json(
            "/jobs",
            json!({
                "name": "numbers",
                "query": query,
                "connectionId": connection["id"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    job["id"].as_i64().expect("job id")
}

#[tokio::test]
async fn test_tracker_detail_and_history_after_delete() {
    let (_container, _exports, state, router) = setup_app().await;
    let job_id = create_job(&router, "SELECT 1 AS id, 'alpha' AS label").await;

    let tracker = state
        .executor
        .execute(JobExecution::manual(job_id as i32))
        .await
        .expect("Execution failed")
        .expect("Tracker should be created");

    let (status, detail) = send(&router, get(&format!("/trackers/{}", tracker.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "success");
    assert_eq!(detail["jobName"], "numbers");
    assert_eq!(detail["header"], json!(["id", "label"]));
    assert_eq!(detail["rowsPreview"], json!([{ "id": 1, "label": "alpha" }]));

    let (status, _) = send(&router, get(&format!("/trackers/{}", tracker.id + 1000))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, post_json("/jobs/delete", json!({ "id": job_id }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, history) = send(&router, get(&format!("/jobs/{}/trackers", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert_eq!(history[0]["id"], tracker.id);

    let (status, _) = send(&router, get(&format!("/jobs/{}/trackers", job_id + 1000))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_trackers_stream_resumes_from_last_event_id() {
    let (_container, _exports, state, router) = setup_app().await;
    state.seed_stream().await.expect("Failed to seed stream");
    let job_id = create_job(&router, "SELECT 1 AS id").await;
    state
        .executor
        .execute(JobExecution::manual(job_id as i32))
        .await
        .expect("Execution failed")
        .expect("Tracker should be created");

    let wait = Duration::from_secs(5);
    let first = first_event(&router, get("/stream/trackers"), wait)
        .await
        .expect("Subscriber should get the current snapshot");
    assert!(first
        .lines()
        .any(|line| line.strip_prefix("event:").map(str::trim) == Some("trackers")));
    assert!(first.contains("\"status\":\"success\""));
    let seq = event_id(&first);

    let repeated = first_event(&router, get("/stream/trackers"), wait)
        .await
        .expect("Repeated subscribe should get the snapshot again");
    assert_eq!(event_id(&repeated), seq);

    let resumed = Request::builder()
        .uri("/stream/trackers")
        .header("last-event-id", seq.to_string())
        .body(Body::empty())
        .expect("Failed to build request");
    let nothing_new = first_event(&router, resumed, Duration::from_millis(300)).await;
    assert!(nothing_new.is_none());

    let from_earlier_process = Request::builder()
        .uri("/stream/trackers")
        .header("last-event-id", (seq + 1_000_000_000).to_string())
        .body(Body::empty())
        .expect("Failed to build request");
    let current = first_event(&router, from_earlier_process, wait)
        .await
        .expect("A cursor ahead of the topic gets the current snapshot");
    assert_eq!(event_id(&current), seq);
}
