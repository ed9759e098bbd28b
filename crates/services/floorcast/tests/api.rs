//! Session API driven through the router

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use common::{Call, FakeControlPlane, FakePipeline};
use floorcast::api::{build_router, AppState};
use floorcast::config::Config;
use floorcast::control_plane::{ControlPlaneError, Ingestor};
use floorcast::lifecycle::LifecycleManager;
use floorcast::session::{Session, SessionStatus};

const DISPLAY_ORIGIN: &str = "http://localhost:5173";

fn app(plane: &Arc<FakeControlPlane>) -> (Router, Session) {
    let lifecycle = Arc::new(LifecycleManager::new(plane.clone()));
    let session = Session::new(lifecycle, FakePipeline::new());
    let mut config = Config::default();
    config.server.allowed_origins = vec![DISPLAY_ORIGIN.to_string()];
    let state = AppState::new(session.clone(), Arc::new(config));
    (build_router(state), session)
}

/// CORS preflight for a start request from `origin`
async fn preflight(router: &Router, origin: &str) -> (StatusCode, HeaderMap) {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/session")
        .header("origin", origin)
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    (response.status(), response.headers().clone())
}

async fn request(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn wait_for(session: &Session, wanted: SessionStatus) {
    let mut rx = session.watch_status();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
        .await
        .expect("status not reached")
        .unwrap();
}

#[tokio::test]
async fn test_health_check() {
    let plane = FakeControlPlane::with_ingestors(vec![]);
    let (router, _) = app(&plane);

    let (status, body) = request(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_session_start_status_and_stop() {
    let plane = FakeControlPlane::with_ingestors(vec![
        Ingestor::unavailable("ing_a"),
        Ingestor::available("ing_b"),
    ]);
    let (router, session) = app(&plane);

    let (status, body) = request(&router, "GET", "/api/session", None).await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["status"], "idle");

    let (status, _) = request(&router, "POST", "/api/session", Some(r#"{"name":"demo"}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for(&session, SessionStatus::Publishing).await;

    let (status, body) = request(&router, "GET", "/api/session", None).await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["status"], "publishing");
    assert_eq!(info["stream_id"], "stream_1");
    assert_eq!(info["ingestor_id"], "ing_b");
    assert!(!String::from_utf8_lossy(&body).contains("key-ing_b"));

    let (status, body) = request(&router, "POST", "/api/session", Some("{}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "session_active");

    let (status, _) = request(&router, "DELETE", "/api/session", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for(&session, SessionStatus::Idle).await;
    assert_eq!(plane.count(&Call::DeleteStream("stream_1".to_string())), 1);
    assert_eq!(plane.count(&Call::CreateStream("demo".to_string())), 1);
}

#[tokio::test]
async fn test_failed_start_is_visible_in_status() {
    let plane = FakeControlPlane::with_ingestors(vec![Ingestor::unavailable("ing_a")]);
    let (router, session) = app(&plane);

    let (status, _) = request(&router, "POST", "/api/session", Some("{}")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for(&session, SessionStatus::Failed).await;

    let (_, body) = request(&router, "GET", "/api/session", None).await;
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["status"], "failed");
    assert_eq!(info["failure"], "no_ingestor_available");
    assert_eq!(plane.count(&Call::CreateStream("floorcast".to_string())), 1);
}

#[tokio::test]
async fn test_failure_detail_stays_out_of_status() {
    let plane = FakeControlPlane::with_ingestors(vec![Ingestor::available("ing_a")]);
    plane.fail_select_with(
        "ing_a",
        ControlPlaneError::Api {
            status: 500,
            message: "internal: db host 10.0.3.7 refused connection".to_string(),
        },
    );
    let (router, session) = app(&plane);

    request(&router, "POST", "/api/session", Some("{}")).await;
    wait_for(&session, SessionStatus::Failed).await;

    let (_, body) = request(&router, "GET", "/api/session", None).await;
    let text = String::from_utf8_lossy(&body);
    assert!(!text.contains("10.0.3.7"));
    assert!(!text.contains("refused"));
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["failure"], "control_plane");
}

#[tokio::test]
async fn test_back_to_back_starts_claim_once() {
    let plane = FakeControlPlane::with_ingestors(vec![Ingestor::available("ing_a")]);
    let (router, session) = app(&plane);

    let (first, body) = request(&router, "POST", "/api/session", Some(r#"{"name":"demo"}"#)).await;
    let (second, _) = request(&router, "POST", "/api/session", Some(r#"{"name":"demo"}"#)).await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::CONFLICT);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["status"], "selecting");
    assert!(info["session_id"].as_str().unwrap().starts_with("sess_"));

    wait_for(&session, SessionStatus::Publishing).await;
    assert_eq!(plane.count(&Call::CreateStream("demo".to_string())), 1);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_cors_allows_only_configured_origins() {
    let plane = FakeControlPlane::with_ingestors(vec![]);
    let (router, _) = app(&plane);

    let (_, headers) = preflight(&router, "https://evil.example").await;
    assert!(headers.get("access-control-allow-origin").is_none());

    let (status, headers) = preflight(&router, DISPLAY_ORIGIN).await;
    assert!(status.is_success());
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        DISPLAY_ORIGIN
    );
    let methods = headers
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(methods.contains("POST"));
    assert!(!methods.contains('*'));
}

#[tokio::test]
async fn test_cross_site_form_post_cannot_start_a_session() {
    let plane = FakeControlPlane::with_ingestors(vec![Ingestor::available("ing_a")]);
    let (router, session) = app(&plane);

    // A simple request needs no preflight, so the body type is the gate
    let request = Request::builder()
        .method("POST")
        .uri("/api/session")
        .header("origin", "https://evil.example")
        .header("content-type", "text/plain")
        .body(Body::from(r#"{"name":"x"}"#))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(response.headers().get("access-control-allow-origin").is_none());
    assert_eq!(session.status(), SessionStatus::Idle);
    assert!(plane.calls().is_empty());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let plane = FakeControlPlane::with_ingestors(vec![]);
    let (router, _) = app(&plane);

    let (status, body) = request(&router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: Value = serde_json::from_slice(&body).unwrap();
    assert!(snapshot["chunks_sent"].is_u64());
    assert!(snapshot["sessions_started"].is_u64());
}
