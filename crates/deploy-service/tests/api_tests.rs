//! Integration tests for Deploy Service API

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use bothost_common::Result;
use deploy_service::{create_router, AppState};
use deployer::{
    DeployerConfig, MemorySink, MockEngine, Orchestrator, SourceFetcher,
    CONTAINER_NOT_FOUND_PLACEHOLDER,
};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

const REPO: &str = "https://github.com/example/bot.git";

/// Writes a Node project, as if cloned
struct NodeFetcher;

#[async_trait]
impl SourceFetcher for NodeFetcher {
    async fn fetch(&self, _source: &str, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("package.json"), r#"{"name":"bot"}"#).await?;
        tokio::fs::write(dest.join("index.js"), "console.log('ready')").await?;
        Ok(())
    }
}

/// Helper to create test app with a temporary workspace root
fn create_test_app() -> (axum::Router, MockEngine, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let engine = MockEngine::new();

    let orchestrator = Orchestrator::new(
        Arc::new(engine.clone()),
        Arc::new(NodeFetcher),
        Arc::new(MemorySink::new()),
        DeployerConfig {
            workspace_root: root.path().join("workspaces"),
            ..DeployerConfig::default()
        },
    );

    (create_router(AppState::new(orchestrator)), engine, root)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, json)
}

async fn deploy(app: &axum::Router, owner: &str, plan: Option<&str>) -> (StatusCode, Value) {
    let mut body = json!({ "owner_id": owner, "repo_url": REPO });
    if let Some(plan) = plan {
        body["plan"] = json!(plan);
    }
    send(app, "POST", "/api/deploy", Some(body)).await
}

async fn wait_for_status(app: &axum::Router, id: &str, status: &str) -> Value {
    for _ in 0..500 {
        let (code, json) = send(app, "GET", &format!("/api/deployments/{}", id), None).await;
        assert_eq!(code, StatusCode::OK);
        if json["deployment"]["status"] == status {
            return json["deployment"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment {} never reached {}", id, status);
}

#[tokio::test]
async fn test_health_check() {
    let (app, engine, _root) = create_test_app();

    let (status, json) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "deploy-service");

    engine.set_unavailable(true);
    let (status, json) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn test_deploy_and_manage_lifecycle() {
    let (app, engine, _root) = create_test_app();

    let (status, json) = deploy(&app, "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "Deployment queued.");
    let id = json["deployment_id"].as_str().unwrap().to_string();

    let deployment = wait_for_status(&app, &id, "RUNNING").await;
    assert_eq!(deployment["owner_id"], "alice");
    assert_eq!(deployment["resources"]["memory_limit_mb"], 128);
    assert!(deployment["container_ref"].is_string());

    let (status, json) = send(&app, "POST", &format!("/api/deployments/{}/stop", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Deployment stopped");
    wait_for_status(&app, &id, "STOPPED").await;

    let (status, json) = send(&app, "POST", &format!("/api/deployments/{}/start", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Deployment started");

    let (status, json) = send(&app, "POST", &format!("/api/deployments/{}/start", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Deployment is already running");

    let container = engine.containers()[0].id.clone();
    engine.push_logs(&container, b"line one\nline two\n");
    let (status, json) = send(&app, "GET", &format!("/api/deployments/{}/logs?tail=1", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["logs"], "line two\n");

    let (status, _) = send(&app, "DELETE", &format!("/api/deployments/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(engine.containers().is_empty());

    let (status, json) = send(&app, "GET", &format!("/api/deployments/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("not found"));

    let (status, json) = send(&app, "GET", &format!("/api/deployments/{}/logs", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["logs"], CONTAINER_NOT_FOUND_PLACEHOLDER);
}

#[tokio::test]
async fn test_plan_limit_is_enforced() {
    let (app, _engine, _root) = create_test_app();

    let (status, _) = deploy(&app, "bob", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = deploy(&app, "bob", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(json["error"].as_str().unwrap().contains("1/1"));

    let (status, _) = deploy(&app, "bob", Some("pro")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&app, "GET", "/api/owners/bob/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 2);
    assert_eq!(json["owner_id"], "bob");
}

#[tokio::test]
async fn test_plan_sets_memory_limit() {
    let (app, engine, _root) = create_test_app();

    let (_, json) = deploy(&app, "carol", Some("enterprise")).await;
    let id = json["deployment_id"].as_str().unwrap().to_string();
    wait_for_status(&app, &id, "RUNNING").await;

    assert_eq!(engine.containers()[0].memory_bytes, 1024 * 1024 * 1024);
}

#[tokio::test]
async fn test_deploy_rejects_invalid_input() {
    let (app, _engine, _root) = create_test_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/deploy",
        Some(json!({ "owner_id": "dave", "repo_url": "--upload-pack=evil" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, json) = send(
        &app,
        "POST",
        "/api/deploy",
        Some(json!({ "owner_id": "dave", "repo_url": REPO, "plan": "platinum" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, json) = send(&app, "POST", "/api/deploy", Some(json!({ "owner_id": "zed" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("repository URL is required"));

    let request = Request::builder()
        .method("POST")
        .uri("/api/deploy")
        .header("content-type", "application/json")
        .body(Body::from("{\"owner_id\": "))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].is_string());

    let (status, json) = send(&app, "GET", "/api/owners/zed/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let (app, _engine, _root) = create_test_app();
    let unknown = "1b4e28ba-2fa1-4d3b-a3f5-ef19b5a7633b";

    let (status, _) = send(&app, "GET", &format!("/api/deployments/{}", unknown), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", &format!("/api/deployments/{}/start", unknown), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", &format!("/api/deployments/{}", unknown), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "GET", "/api/deployments/abc/logs", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_engine_outage_is_service_unavailable() {
    let (app, engine, _root) = create_test_app();

    let (_, json) = deploy(&app, "erin", None).await;
    let id = json["deployment_id"].as_str().unwrap().to_string();
    wait_for_status(&app, &id, "RUNNING").await;

    engine.set_unavailable(true);
    let (status, json) = send(&app, "POST", &format!("/api/deployments/{}/stop", id), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("unavailable"));
}
