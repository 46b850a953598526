//! API key middleware tests

#![cfg(unix)]

mod common;

use axum::http::{Request, StatusCode};
use axum::body::Body;
use common::{extract_json_body, TestApp, TEST_API_KEY};
use serde_json::Value;
use tenant_orchestrator::test_utils::FakeTool;

async fn keyed_app() -> TestApp {
    TestApp::with_config(FakeTool::new(), |config| {
        config.api_key = Some(TEST_API_KEY.to_string());
    })
    .await
}

fn request_with_key(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-api-key", key)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_missing_key_is_rejected() {
    let app = keyed_app().await;

    let response = app.get("/api/v1/tenants").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"], "Missing x-api-key header");
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let app = keyed_app().await;

    let response = app
        .send(request_with_key("/api/v1/operations", "not-the-key"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"], "Invalid API key");
}

#[tokio::test]
async fn test_valid_key_is_accepted() {
    let app = keyed_app().await;

    let response = app
        .send(request_with_key("/api/v1/tenants", TEST_API_KEY))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_rejected_request_starts_no_work() {
    let app = keyed_app().await;

    let response = app
        .post_json("/api/v1/tenants", serde_json::json!({ "name": "Acme" }))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(app.env.store.list().await.unwrap().is_empty());
    assert!(app.env.tool.calls().is_empty());
}

#[tokio::test]
async fn test_health_and_docs_skip_authentication() {
    let app = keyed_app().await;

    assert_eq!(app.get("/health").await.status(), StatusCode::OK);
    assert_eq!(app.get("/health/ready").await.status(), StatusCode::OK);
    assert_eq!(
        app.get("/api-docs/openapi.json").await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_no_configured_key_allows_all_requests() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app.get("/api/v1/tenants").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .send(request_with_key("/api/v1/tenants", "anything"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
