//! Integration tests for REST API endpoints
//!
//! Tests registration, status and outputs, sub-tenants, cascading deletes,
//! infrastructure-only teardown and the operation history endpoints. The
//! scheduler runs for real against a fake infrastructure tool.

#![cfg(unix)]

mod common;

use axum::http::StatusCode;
use common::{empty_request, extract_json_body, TestApp};
use serde_json::{json, Value};
use std::time::Duration;
use tenant_orchestrator::test_utils::{FakeStep, FakeTool};
use tenant_orchestrator::{Environment, NewTenant, TenantStatus};
use tower::ServiceExt; // for `oneshot`

async fn pending_tenant(app: &TestApp, name: &str) -> String {
    app.env
        .store
        .create(NewTenant {
            name: name.to_string(),
            environment: Environment::Dev,
            region: "me-central2".to_string(),
            parent_id: None,
        })
        .await
        .expect("Failed to create tenant")
        .id
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "tenant-api");
}

#[tokio::test]
async fn test_readiness_reports_database_and_tool() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app.get("/health/ready").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["active_operations"], 0);
}

#[tokio::test]
async fn test_register_tenant_provisions_to_completion() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app
        .post_json(
            "/api/v1/tenants",
            json!({ "name": "Acme Corp", "environment": "staging" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body: Value = extract_json_body(response).await;
    let id = body["tenant_id"].as_str().expect("tenant_id").to_string();
    assert_eq!(body["status"], "in_progress");
    assert_eq!(body["job_id"], format!("job-{}", &id[..8]));
    assert_eq!(body["status_url"], format!("/api/v1/tenants/{}", id));

    app.env.scheduler.wait_for(&id).await;

    let response = app.get(&format!("/api/v1/tenants/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let record: Value = extract_json_body(response).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["environment"], "staging");
    // Region falls back to the configured default.
    assert_eq!(record["region"], "me-central2");
    assert_eq!(record["outputs"]["db_instance_name"], "mysql-instance-dev");
    assert!(record["outputs"].get("db_password").is_none());
}

#[tokio::test]
async fn test_register_rejects_invalid_input() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app
        .post_json("/api/v1/tenants", json!({ "name": "   " }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("tenant name"));

    let response = app
        .post_json(
            "/api/v1/tenants",
            json!({ "name": "Acme", "environment": "qa" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    assert!(app.env.store.list().await.unwrap().is_empty());
    assert!(app.env.tool.calls().is_empty());
}

#[tokio::test]
async fn test_failed_provision_is_classified() {
    let tool = FakeTool::new().on(
        "apply",
        FakeStep::Fail("Error: googleapi: Error 403: Permission denied on resource".to_string()),
    );
    let app = TestApp::new(tool).await;

    let id = app.register("Acme").await;

    let record: Value = extract_json_body(app.get(&format!("/api/v1/tenants/{}", id)).await).await;
    assert_eq!(record["status"], "failed");
    let message = record["error_message"].as_str().unwrap();
    assert!(message.starts_with("apply failed: "));
    assert!(message.contains("SOLUTION:"));
    assert!(record["outputs"].is_null());
}

#[tokio::test]
async fn test_get_unknown_tenant_returns_404() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app.get("/api/v1/tenants/does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"], "Tenant not found: does-not-exist");
}

#[tokio::test]
async fn test_list_tenants_with_status_filter() {
    let app = TestApp::new(FakeTool::new()).await;

    let completed = app.register("Completed Co").await;
    let pending = pending_tenant(&app, "Pending Co").await;

    let body: Value = extract_json_body(app.get("/api/v1/tenants").await).await;
    assert_eq!(body["total"], 2);
    // Newest first.
    assert_eq!(body["tenants"][0]["id"], pending);
    assert_eq!(body["tenants"][1]["id"], completed);

    let body: Value =
        extract_json_body(app.get("/api/v1/tenants?status=completed").await).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["tenants"][0]["id"], completed);
    assert_eq!(body["tenants"][0]["status"], "completed");
}

#[tokio::test]
async fn test_outputs_require_completed_deployment() {
    let app = TestApp::new(FakeTool::new()).await;

    let pending = pending_tenant(&app, "Pending Co").await;
    let response = app.get(&format!("/api/v1/tenants/{}/outputs", pending)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert_eq!(
        body["error"],
        "Deployment not completed. Current status: pending"
    );

    let id = app.register("Acme").await;
    let response = app.get(&format!("/api/v1/tenants/{}/outputs", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let outputs: Value = extract_json_body(response).await;
    assert_eq!(outputs["private_bucket_name"], "tenant-private");
    assert!(outputs.get("db_password").is_none());
}

#[tokio::test]
async fn test_sub_tenant_provisions_against_parent() {
    let app = TestApp::new(FakeTool::new()).await;

    let parent = app.register("Main Hospital").await;
    let child = app.register_sub(&parent, "Clinic A").await;

    let record: Value =
        extract_json_body(app.get(&format!("/api/v1/tenants/{}", child)).await).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["parent_id"], parent);
    assert_eq!(app.env.tool.calls_for(&child), vec!["init", "apply", "output"]);

    let tfvars = std::fs::read_to_string(app.env.workspace(&child).join("terraform.tfvars"))
        .expect("Failed to read tfvars");
    assert!(tfvars.contains("mysql-instance-dev"));
}

#[tokio::test]
async fn test_sub_tenant_of_unready_parent_is_left_failed() {
    let app = TestApp::new(FakeTool::new()).await;
    let parent = pending_tenant(&app, "Main Hospital").await;

    let response = app
        .post_json(
            &format!("/api/v1/tenants/{}/sub-tenants", parent),
            json!({ "name": "Clinic A" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("parent tenant not ready"));

    let children = app.env.store.list_children(&parent).await.unwrap();
    assert_eq!(children.len(), 1);
    // The error names the record it left behind.
    assert!(error.contains(&format!("sub-tenant {} was recorded as failed", children[0].id)));
    assert_eq!(children[0].status, TenantStatus::Failed);
    assert!(children[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("is pending"));
    assert!(!app.env.workspace(&children[0].id).exists());
}

#[tokio::test]
async fn test_sub_tenant_of_unknown_parent_returns_404() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app
        .post_json(
            "/api/v1/tenants/missing/sub-tenants",
            json!({ "name": "Clinic A" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(app.env.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_operations_conflict_while_provisioning() {
    let app = TestApp::new(FakeTool::new().delay("apply", Duration::from_millis(800))).await;

    let response = app
        .post_json("/api/v1/tenants", json!({ "name": "Acme" }))
        .await;
    let body: Value = extract_json_body(response).await;
    let id = body["tenant_id"].as_str().unwrap().to_string();

    let response = app
        .post_empty(&format!("/api/v1/tenants/{}/destroy-infrastructure", id))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.delete(&format!("/api/v1/tenants/{}", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.post_empty(&format!("/api/v1/tenants/{}/tables", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.env.scheduler.wait_for(&id).await;
    let record = app.env.store.get(&id).await.unwrap();
    assert_eq!(record.status, TenantStatus::Completed);
}

#[tokio::test]
async fn test_delete_cascades_to_sub_tenants() {
    let app = TestApp::new(FakeTool::new()).await;

    let parent = app.register("Main Hospital").await;
    let child = app.register_sub(&parent, "Clinic A").await;

    let response = app.delete(&format!("/api/v1/tenants/{}", parent)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["infrastructure_destroyed"], true);
    assert_eq!(body["sub_tenants_deleted"], json!([child.clone()]));

    assert!(app.env.store.find(&parent).await.unwrap().is_none());
    assert!(app.env.store.find(&child).await.unwrap().is_none());
    assert!(!app.env.workspace(&parent).exists());
    assert!(!app.env.workspace(&child).exists());

    // The sub-tenant is destroyed before its parent.
    let destroys: Vec<String> = app
        .env
        .tool
        .calls()
        .into_iter()
        .filter(|(verb, _)| verb == "destroy")
        .map(|(_, tenant)| tenant)
        .collect();
    assert_eq!(destroys, vec![child, parent]);
}

#[tokio::test]
async fn test_sub_tenant_registration_during_parent_delete_is_rejected() {
    let app = TestApp::new(FakeTool::new().delay("destroy", Duration::from_millis(600))).await;
    let parent = app.register("Main Hospital").await;
    let child = app.register_sub(&parent, "Clinic A").await;

    let router = app.app.clone();
    let uri = format!("/api/v1/tenants/{}", parent);
    let delete = tokio::spawn(async move { router.oneshot(empty_request("DELETE", &uri)).await });
    // Let the cascade reach the existing child's destroy.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app
        .post_json(
            &format!("/api/v1/tenants/{}/sub-tenants", parent),
            json!({ "name": "Clinic B" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("parent tenant busy"));

    let response = delete.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    let deleted = body["sub_tenants_deleted"].as_array().unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.contains(&json!(child.as_str())));

    // No orphaned child and no infrastructure for the late one.
    assert!(app.env.store.list().await.unwrap().is_empty());
    let calls = app.env.tool.calls();
    assert!(calls.iter().all(|(_, tenant)| *tenant == parent || *tenant == child));
    assert_eq!(app.env.tool.calls_for(&child), vec!["init", "apply", "output", "destroy"]);
    assert_eq!(app.env.tool.calls_for(&parent), vec!["init", "apply", "output", "destroy"]);
}

#[tokio::test]
async fn test_delete_failure_keeps_record_as_failed() {
    let tool = FakeTool::new().on(
        "destroy",
        FakeStep::Fail("Error: instance is in use".to_string()),
    );
    let app = TestApp::new(tool).await;
    let id = app.register("Acme").await;

    let response = app.delete(&format!("/api/v1/tenants/{}", id)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("destroy failed: Error: instance is in use"));

    let record = app.env.store.get(&id).await.unwrap();
    assert_eq!(record.status, TenantStatus::Failed);
    assert!(app.env.workspace(&id).exists());
}

#[tokio::test]
async fn test_delete_with_skip_infrastructure_only_removes_records() {
    let app = TestApp::new(FakeTool::new()).await;

    let parent = app.register("Main Hospital").await;
    let child = app.register_sub(&parent, "Clinic A").await;

    let response = app
        .delete(&format!(
            "/api/v1/tenants/{}?skip_infrastructure=true",
            parent
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["infrastructure_destroyed"], false);

    assert!(app.env.store.find(&parent).await.unwrap().is_none());
    assert!(app.env.store.find(&child).await.unwrap().is_none());
    assert!(app
        .env
        .tool
        .calls()
        .iter()
        .all(|(verb, _)| verb != "destroy"));
}

#[tokio::test]
async fn test_destroy_infrastructure_keeps_record_without_outputs() {
    let app = TestApp::new(FakeTool::new()).await;
    let id = app.register("Acme").await;

    let response = app
        .post_empty(&format!("/api/v1/tenants/{}/destroy-infrastructure", id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["destroyed"], true);

    // The record stays, but no longer advertises the destroyed resources.
    let record = app.env.store.get(&id).await.unwrap();
    assert_eq!(record.status, TenantStatus::Failed);
    assert!(record.outputs.is_none());
    assert!(record
        .error_message
        .unwrap_or_default()
        .starts_with("infrastructure destroyed"));
    assert!(!app.env.workspace(&id).exists());
    let response = app.get(&format!("/api/v1/tenants/{}/outputs", id)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // A second call finds no workspace and runs nothing.
    let response = app
        .post_empty(&format!("/api/v1/tenants/{}/destroy-infrastructure", id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["destroyed"], false);
    assert_eq!(
        app.env.tool.calls_for(&id),
        vec!["init", "apply", "output", "destroy"]
    );
}

#[tokio::test]
async fn test_tables_require_completed_tenant() {
    let app = TestApp::new(FakeTool::new()).await;
    let pending = pending_tenant(&app, "Pending Co").await;

    let response = app
        .post_empty(&format!("/api/v1/tenants/{}/tables", pending))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("current status: pending"));

    let response = app.post_empty("/api/v1/tenants/missing/tables").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_operation_history_endpoints() {
    let app = TestApp::new(FakeTool::new()).await;
    let id = app.register("Acme").await;
    app.post_empty(&format!("/api/v1/tenants/{}/destroy-infrastructure", id))
        .await;

    let response = app
        .get(&format!("/api/v1/operations?tenant_id={}", id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let operations: Vec<Value> = extract_json_body(response).await;
    assert_eq!(operations.len(), 2);
    assert!(operations.iter().all(|op| op["status"] == "success"));

    let response = app
        .get(&format!("/api/v1/operations?tenant_id={}&type=provision", id))
        .await;
    let provisions: Vec<Value> = extract_json_body(response).await;
    assert_eq!(provisions.len(), 1);
    let op_id = provisions[0]["id"].as_str().unwrap().to_string();

    let response = app.get(&format!("/api/v1/operations/{}", op_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let op: Value = extract_json_body(response).await;
    assert_eq!(op["tenant_id"], id);
    assert_eq!(op["operation_type"], "provision");

    let response = app.get("/api/v1/operations?type=rollback").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.get("/api/v1/operations/missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"], "Operation not found: missing");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = TestApp::new(FakeTool::new()).await;

    let response = app.get("/api-docs/openapi.json").await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc: Value = extract_json_body(response).await;
    assert!(doc["paths"].get("/api/v1/tenants").is_some());
    assert!(doc["paths"].get("/api/v1/tenants/{id}/tables").is_some());
    assert!(doc["paths"].get("/api/v1/operations").is_some());
}
