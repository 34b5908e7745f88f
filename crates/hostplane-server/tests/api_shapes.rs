//! Response shapes and status codes of the HTTP surface, driven through the
//! router without a listening socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use hostplane_cluster::{ClusterManager, MemoryCluster};
use hostplane_core::{ClusterMode, HostplaneConfig};
use hostplane_runtime::{Context, MemoryAlertSink, PolicyTable, Worker};
use hostplane_server::{build_router, AppState};
use hostplane_store::SqliteStore;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    ctx: Arc<Context>,
    app: Router,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = HostplaneConfig::with_defaults(dir.path()).unwrap();
        config.cluster.mode = ClusterMode::Memory;
        let store = Arc::new(SqliteStore::open(&config.data_paths.db).unwrap());
        let manager = Arc::new(ClusterManager::in_memory(
            Arc::new(MemoryCluster::new()),
            &config.cluster,
        ));
        let ctx = Context::with_parts(
            config,
            store,
            manager,
            Arc::new(MemoryAlertSink::new()),
            PolicyTable::default(),
        );
        let app = build_router(Arc::new(AppState::new(ctx.clone())));
        Self { _dir: dir, ctx, app }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn drain(&self) {
        let worker = Worker::new(self.ctx.clone(), "api-test-worker");
        while worker.run_once().await.unwrap().is_some() {}
    }

    async fn create(&self) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/api/instances",
                Some(json!({ "tenant_id": "t-1", "name": "Shop", "version": "17.0" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        body["instance"]["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health_shape() {
    let h = Harness::new();
    let (status, body) = h.call("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["instances"].is_number());
    assert!(body["uptimeSecs"].is_number());
    assert_eq!(body["routingVersion"], 1);
    assert_eq!(body["cluster"]["reachable"], true);
}

#[tokio::test]
async fn test_create_instance_shape() {
    let h = Harness::new();
    let (status, body) = h
        .call(
            "POST",
            "/api/instances",
            Some(json!({ "tenant_id": "t-1", "name": "Shop", "version": "17.0" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["instance"]["id"].is_string());
    assert_eq!(body["instance"]["status"], "pending");
    assert!(body["instance"]["sizing"]["cpu_millis"].is_number());
    assert!(body["instance"]["deployment_name"].as_str().unwrap().starts_with("inst-"));
    assert_eq!(body["task"]["queue"], "provisioning");
    assert_eq!(body["task"]["kind"]["type"], "provision");
    assert_eq!(body["task"]["status"], "pending");
}

#[tokio::test]
async fn test_error_status_codes() {
    let h = Harness::new();

    let (status, body) = h.call("GET", "/api/instances/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
    assert!(body["error"].is_string());

    let (status, body) = h
        .call(
            "POST",
            "/api/instances",
            Some(json!({ "tenant_id": "t-1", "name": "Shop", "version": "bad tag" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, _) = h.call("GET", "/api/instances?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.call("GET", "/api/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lifecycle_over_http() {
    let h = Harness::new();
    let id = h.create().await;
    h.drain().await;

    let (status, body) = h.call("GET", &format!("/api/instances/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = h
        .call("POST", &format!("/api/instances/{}/stop", id), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task"]["id"].as_str().unwrap().to_string();
    h.drain().await;

    let (status, body) = h.call("GET", &format!("/api/tasks/{}", task_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["attempts"], 1);

    let (status, _) = h
        .call("DELETE", &format!("/api/instances/{}?retain_volume=true", id), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    h.drain().await;

    let (_, body) = h.call("GET", &format!("/api/instances/{}", id), None).await;
    assert_eq!(body["status"], "terminated");

    let (status, body) = h
        .call("POST", &format!("/api/instances/{}/start", id), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "invalid_transition");

    let (status, body) = h
        .call("GET", &format!("/api/instances/{}/transitions", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let last = body["transitions"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["from"], "terminating");
    assert_eq!(last["to"], "terminated");

    let (_, body) = h
        .call("GET", &format!("/api/instances/{}/tasks", id), None)
        .await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["tasks"][0]["kind"]["type"], "terminate");
}

#[tokio::test]
async fn test_backups_shape() {
    let h = Harness::new();
    let id = h.create().await;
    h.drain().await;

    let (status, body) = h
        .call("GET", &format!("/api/instances/{}/backups", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance_id"], id.as_str());
    assert_eq!(body["instance_name"], "Shop");
    assert_eq!(body["total_backups"], 0);
    assert!(body["backups"].as_array().unwrap().is_empty());

    let (status, body) = h
        .call("POST", &format!("/api/instances/{}/backups", id), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["task"]["queue"], "maintenance");
    h.drain().await;

    let (_, body) = h
        .call("GET", &format!("/api/instances/{}/backups", id), None)
        .await;
    assert_eq!(body["total_backups"], 1);
    let backup = &body["backups"][0];
    assert!(backup["backup_name"].as_str().unwrap().starts_with(&format!("{}_", id)));
    assert!(backup["created_at"].is_string());
    assert!(backup["total_size"].is_number());

    let (status, _) = h
        .call(
            "POST",
            &format!("/api/instances/{}/restore", id),
            Some(json!({ "backup_name": "someone-else_20240101000000" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queues_shape() {
    let h = Harness::new();
    h.create().await;

    let (status, body) = h.call("GET", "/api/queues", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routingVersion"], 1);
    let queues = body["queues"].as_array().unwrap();
    assert_eq!(queues.len(), 5);
    let provisioning = queues.iter().find(|q| q["queue"] == "provisioning").unwrap();
    assert_eq!(provisioning["pending"], 1);
    assert_eq!(provisioning["maxRetries"], 0);
    let monitoring = queues.iter().find(|q| q["queue"] == "monitoring").unwrap();
    assert_eq!(monitoring["maxRetries"], 3);
}
