mod test_harness;

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use render_queue::api::{router, ApiState};
use render_queue::scheduler::SchedulerService;
use test_harness::{assert_eventually, ephemeral_scheduler, scene, FakeRunner, Script};

/// Create a test app backed by a scheduler with in-memory stores
fn create_test_app(runner: std::sync::Arc<FakeRunner>) -> Router {
    let scheduler = SchedulerService::spawn(ephemeral_scheduler(false), runner);
    router(ApiState { scheduler })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn add(app: &Router, path: &std::path::Path) -> Value {
    let (status, job) = send(app, "POST", "/api/jobs", Some(json!({ "path": path }))).await;
    assert_eq!(status, StatusCode::CREATED);
    job
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let app = create_test_app(FakeRunner::new());

    let (status, json) = send(&app, "GET", "/api/jobs", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_add_job_endpoint() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    let path = scene(&dir, "intro.blend");

    let job = add(&app, &path).await;
    assert_eq!(job["name"], "intro.blend");
    assert_eq!(job["status"], "ready");
    assert_eq!(job["attempts"], 0);
    assert!(job["last_duration_secs"].is_null());

    let (status, jobs) = send(&app, "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["id"], job["id"]);
}

#[tokio::test]
async fn test_add_job_rejections() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    let path = scene(&dir, "intro.blend");
    add(&app, &path).await;

    let (status, body) = send(&app, "POST", "/api/jobs", Some(json!({ "path": path }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("Already in queue"));

    let text = dir.path().join("notes.txt");
    std::fs::write(&text, "hello").unwrap();
    let (status, _) = send(&app, "POST", "/api/jobs", Some(json!({ "path": text }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = dir.path().join("missing.blend");
    let (status, _) = send(&app, "POST", "/api/jobs", Some(json!({ "path": missing }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_remove_job_endpoint() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    let job = add(&app, &scene(&dir, "intro.blend")).await;
    let id = job["id"].as_str().unwrap();

    let (status, removed) = send(&app, "DELETE", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["id"], id);

    let (status, body) = send(&app, "DELETE", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_invalid_job_id_is_rejected() {
    let app = create_test_app(FakeRunner::new());

    let (status, body) = send(&app, "DELETE", "/api/jobs/not-a-uuid", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_malformed_body_is_rejected_as_json() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    let job = add(&app, &scene(&dir, "a.blend")).await;
    let uri = format!("/api/jobs/{}/move", job["id"].as_str().unwrap());

    let (status, body) = send(&app, "POST", &uri, Some(json!({ "direction": "sideways" }))).await;
    assert!(status.is_client_error());
    assert!(body["error"].is_string());

    let (status, body) = send(&app, "POST", "/api/jobs", Some(json!({ "file": "a.blend" }))).await;
    assert!(status.is_client_error());
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_move_job_endpoint() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    let first = add(&app, &scene(&dir, "a.blend")).await;
    add(&app, &scene(&dir, "b.blend")).await;
    let uri = format!("/api/jobs/{}/move", first["id"].as_str().unwrap());

    let (status, _) = send(&app, "POST", &uri, Some(json!({ "direction": "up" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "POST", &uri, Some(json!({ "direction": "down" }))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, jobs) = send(&app, "GET", "/api/jobs", None).await;
    assert_eq!(jobs[0]["name"], "b.blend");
    assert_eq!(jobs[1]["name"], "a.blend");
}

#[tokio::test]
async fn test_batch_lifecycle_endpoints() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.script("a.blend", [Script::Hang]);
    let app = create_test_app(runner.clone());
    let job = add(&app, &scene(&dir, "a.blend")).await;

    let (status, started) = send(&app, "POST", "/api/batch/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["started"], true);
    assert_eq!(started["job_id"], job["id"]);

    let (status, running) = send(&app, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["rendering"], job["id"]);
    assert_eq!(running["batch_active"], true);
    assert_eq!(running["render_mode"]["mode"], "animation");

    // A second start is refused while the job renders.
    let (status, _) = send(&app, "POST", "/api/batch/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, cancelled) = send(&app, "POST", "/api/batch/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["cancelled"], true);

    let app_ref = app.clone();
    assert_eventually(
        || {
            let app = app_ref.clone();
            async move {
                let (_, status) = send(&app, "GET", "/api/status", None).await;
                status["rendering"].is_null()
            }
        },
        Duration::from_secs(5),
        "render was not cancelled",
    )
    .await;

    let (_, jobs) = send(&app, "GET", "/api/jobs", None).await;
    assert_eq!(jobs[0]["status"], "canceled");
    assert_eq!(jobs[0]["attempts"], 1);

    let uri = format!("/api/jobs/{}/reset", job["id"].as_str().unwrap());
    let (status, reset) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["status"], "ready");
    assert_eq!(reset["attempts"], 0);
}

#[tokio::test]
async fn test_clear_done_endpoint() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    add(&app, &scene(&dir, "a.blend")).await;

    send(&app, "POST", "/api/batch/start", None).await;
    let app_ref = app.clone();
    assert_eventually(
        || {
            let app = app_ref.clone();
            async move {
                let (_, jobs) = send(&app, "GET", "/api/jobs", None).await;
                jobs[0]["status"] == "done"
            }
        },
        Duration::from_secs(5),
        "job never finished",
    )
    .await;

    let (status, cleared) = send(&app, "POST", "/api/jobs/clear-done", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["count"], 1);

    let (_, jobs) = send(&app, "GET", "/api/jobs", None).await;
    assert_eq!(jobs[0]["status"], "ready");
}

#[tokio::test]
async fn test_eta_and_stats_endpoints() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(FakeRunner::new());
    add(&app, &scene(&dir, "a.blend")).await;

    let (status, eta) = send(&app, "GET", "/api/eta", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(eta["unknown_jobs"], 1);
    assert_eq!(eta["total_seconds"], 0.0);

    let (status, stats) = send(&app, "GET", "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["success_count"], 0);
    assert_eq!(stats["recent_log"], json!([]));
}

#[tokio::test]
async fn test_reload_refused_while_rendering() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    runner.script("a.blend", [Script::Hang]);
    let app = create_test_app(runner);
    add(&app, &scene(&dir, "a.blend")).await;

    // Ephemeral stores reload the last saved snapshot.
    let (status, reloaded) = send(&app, "POST", "/api/jobs/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reloaded["count"], 1);

    send(&app, "POST", "/api/batch/start", None).await;
    let (status, _) = send(&app, "POST", "/api/jobs/reload", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    send(&app, "POST", "/api/batch/cancel", None).await;
}

#[tokio::test]
async fn test_cors_headers_present() {
    let app = create_test_app(FakeRunner::new());

    let request = Request::builder()
        .uri("/api/status")
        .header("origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}
