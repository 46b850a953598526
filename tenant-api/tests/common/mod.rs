//! Common test utilities and helpers for tenant-api tests
//!
//! Builds the router on top of the orchestrator's `TestEnvironment`, so every
//! request runs the real scheduler against a fake infrastructure tool and an
//! in-memory store.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::Value;
use tenant_api::{create_app, AppState, Config, TableInitializer, TablesSettings};
use tenant_orchestrator::test_utils::{FakeTool, TestEnvironment};
use tower::ServiceExt; // for `oneshot`

pub const TEST_API_KEY: &str = "test-key";

pub struct TestApp {
    pub env: TestEnvironment,
    pub app: Router,
}

impl TestApp {
    pub async fn new(tool: FakeTool) -> Self {
        Self::with_config(tool, |_| {}).await
    }

    pub async fn with_config(tool: FakeTool, configure: impl FnOnce(&mut Config)) -> Self {
        let env = TestEnvironment::new(tool).await;

        let mut config = Config::default();
        config.gcp_project_id = "test-project".to_string();
        config.state_bucket = "test-state-bucket".to_string();
        config.gcp_region = "me-central2".to_string();
        config.sql_dir = env.root.path().join("sql");
        configure(&mut config);

        let tables = TableInitializer::new(TablesSettings::from_config(&config));
        let state = AppState::new(env.scheduler.clone(), tables, config);

        Self {
            app: create_app(state),
            env,
        }
    }

    /// Send a request through a clone of the router.
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(empty_request("GET", uri)).await
    }

    pub async fn delete(&self, uri: &str) -> Response {
        self.send(empty_request("DELETE", uri)).await
    }

    pub async fn post_empty(&self, uri: &str) -> Response {
        self.send(empty_request("POST", uri)).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> Response {
        self.send(json_request("POST", uri, body)).await
    }

    /// Register a tenant through the API and wait for its pipeline to finish.
    pub async fn register(&self, name: &str) -> String {
        let response = self
            .post_json("/api/v1/tenants", serde_json::json!({ "name": name }))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = extract_json_body(response).await;
        let id = body["tenant_id"]
            .as_str()
            .expect("tenant_id in registration response")
            .to_string();
        self.env.scheduler.wait_for(&id).await;
        id
    }

    /// Register a sub-tenant of `parent_id` and wait for it to finish.
    pub async fn register_sub(&self, parent_id: &str, name: &str) -> String {
        let response = self
            .post_json(
                &format!("/api/v1/tenants/{}/sub-tenants", parent_id),
                serde_json::json!({ "name": name }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = extract_json_body(response).await;
        let id = body["tenant_id"]
            .as_str()
            .expect("tenant_id in registration response")
            .to_string();
        self.env.scheduler.wait_for(&id).await;
        id
    }
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("Failed to build request")
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("Failed to build request")
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}
