use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use envconfig::Envconfig;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use conductor_server::app_context::AppContext;
use conductor_server::config::Config;
use conductor_server::http;

// The lazy pool never connects in these tests, so only endpoints that stop
// before touching the database are exercised here; everything below the
// gatekeeper is covered by the unit tests in conductor-core.
fn test_app() -> Router {
    let mut env = HashMap::new();
    // The prometheus recorder is a process global; keep it out of tests.
    env.insert("EXPORT_METRICS".to_string(), "false".to_string());
    let config = Config::init_from_hashmap(&env).expect("config from defaults");
    let context = Arc::new(AppContext::new(config).expect("app context"));
    http::router(context)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn index_identifies_the_service() {
    let app = test_app();
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn not_ready_before_first_background_cycle() {
    let app = test_app();
    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_reports_degraded_not_down_while_warming_up() {
    let app = test_app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    // Background loops have not reported yet: degraded, but still serving.
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["overall"], "degraded");
    assert_eq!(body["gatekeeper"]["breaker"], "closed");
}

#[tokio::test]
async fn register_rejects_empty_id() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/register")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"id": "  ", "capacity_max": 10}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn register_rejects_zero_capacity() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/register")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"id": "worker-1", "capacity_max": 0}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_a_client_error() {
    let app = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/heartbeat")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}
