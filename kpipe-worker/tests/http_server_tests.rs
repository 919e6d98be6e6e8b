//! Status server routing and handler tests

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use kpipe_common::topics::STREAM_QUEUED;
use kpipe_common::{FileError, FileStatus, MemoryBroker, MemoryStatusStore, StatusStore, WorkMessage};
use kpipe_worker::admin::{Admin, RETRY_TITLE};
use kpipe_worker::notify::MemoryNotifier;
use kpipe_worker::{build_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    store: Arc<MemoryStatusStore>,
    broker: Arc<MemoryBroker>,
    notifier: Arc<MemoryNotifier>,
    state: AppState,
}

/// Two healthy files and one in error
async fn test_app(allow_reset: bool) -> TestApp {
    let store = Arc::new(MemoryStatusStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let notifier = Arc::new(MemoryNotifier::new());

    store.set_status("a.mp3", FileStatus::Organized).await.unwrap();
    store.set_status("b.mp3", FileStatus::Split).await.unwrap();
    store.incr_retry_counter("metadata", "c.mp3").await.unwrap();
    store
        .set_error("c.mp3", &FileError::new("metadata", "not audio", "0: not audio"))
        .await
        .unwrap();

    let admin = Admin::new(store.clone(), broker.clone(), notifier.clone());
    TestApp {
        store,
        broker,
        notifier,
        state: AppState::new(admin, allow_reset),
    }
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    send(state, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(state: &AppState, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _, bytes) = send(state, request).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = test_app(false).await;
    let (status, _, body) = get(&app.state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "kpipe-worker");
}

#[tokio::test]
async fn status_lists_every_record_with_content_range() {
    let app = test_app(false).await;
    let (status, headers, body) = get(&app.state, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_RANGE], "items 0-2/3");
    let records = json(&body);
    let names: Vec<&str> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["filename"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a.mp3", "b.mp3", "c.mp3"]);
}

#[tokio::test]
async fn single_status_and_not_found() {
    let app = test_app(false).await;

    let (status, _, body) = get(&app.state, "/status/b.mp3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["status"], "split");

    let (status, _, body) = get(&app.state, "/status/ghost.mp3").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn error_views() {
    let app = test_app(false).await;

    let (status, headers, body) = get(&app.state, "/error-files").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_RANGE], "items 0-0/1");
    assert_eq!(json(&body)[0]["filename"], "c.mp3");

    let (status, _, body) = get(&app.state, "/error-details/c.mp3").await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["error"]["stage"], "metadata");
    assert_eq!(body["error"]["message"], "not audio");

    let (status, _, _) = get(&app.state, "/error-details/a.mp3").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pipeline_health_and_metrics_count_per_status() {
    let app = test_app(false).await;

    let (status, _, body) = get(&app.state, "/pipeline-health").await;
    assert_eq!(status, StatusCode::OK);
    let counts = json(&body);
    assert_eq!(counts["organized"], 1);
    assert_eq!(counts["split"], 1);
    assert_eq!(counts["error"], 1);
    assert_eq!(counts["queued"], 0);

    let (status, headers, body) = get(&app.state, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("karaoke_files_error 1\n"));
    assert!(text.contains("karaoke_files_metadata_extracted 0\n"));
    assert!(text.contains("karaoke_uptime_seconds "));
}

#[tokio::test]
async fn retry_resets_and_requeues() {
    let app = test_app(false).await;

    let (status, body) = post_json(&app.state, "/retry", r#"{"filename":"c.mp3"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "ok");

    let record = app.store.get("c.mp3").await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Queued);
    assert!(record.last_error.is_none());
    assert_eq!(record.retries_for("metadata"), 0);
    assert_eq!(app.broker.messages(STREAM_QUEUED), vec![WorkMessage::new("c.mp3")]);
    assert_eq!(app.notifier.count_titled(RETRY_TITLE), 1);
}

#[tokio::test]
async fn retry_rejects_bad_requests() {
    let app = test_app(false).await;

    let (status, _) = post_json(&app.state, "/retry", "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(&app.state, "/retry", r#"{"filename":"  "}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(&app.state, "/retry", r#"{"filename":"ghost.mp3"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(app.broker.messages(STREAM_QUEUED).is_empty());
}

#[tokio::test]
async fn reset_is_forbidden_unless_enabled() {
    let app = test_app(false).await;
    let (status, body) = post_json(&app.state, "/reset", "").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
    assert_eq!(app.store.list_all().await.unwrap().len(), 3);

    let app = test_app(true).await;
    let (status, body) = post_json(&app.state, "/reset", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 3);
    assert!(app.store.list_all().await.unwrap().is_empty());
}
