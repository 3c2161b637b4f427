//! REST API against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use cadeploy_cluster::{InMemoryCluster, ResourceKind};
use cadeploy_core::{CreateOptions, DeployerConfig, DeploymentId};
use cadeploy_manager::DeploymentManager;
use cadeploy_queue::{CheckpointStore, Mailboxes, Outbox, spawn_dispatcher};
use cadeployd::{ApiState, build_router};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
    cluster: InMemoryCluster,
    manager: DeploymentManager,
    store: CheckpointStore,
    state: ApiState,
    router: Router,
}

fn harness() -> Harness {
    let cluster = InMemoryCluster::new();
    let config = Arc::new(DeployerConfig::scaffold("apps", "caches"));
    let manager = DeploymentManager::new(Arc::new(cluster.clone()), config);
    let store = CheckpointStore::open_in_memory().unwrap();
    let mailboxes = Mailboxes::new();
    let (outbox, rx) = Outbox::channel();
    spawn_dispatcher(rx, Arc::new(mailboxes.clone()));
    let state = ApiState::new(manager.clone(), store.clone(), outbox, mailboxes);
    let router = build_router(state.clone());
    Harness {
        cluster,
        manager,
        store,
        state,
        router,
    }
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn empty_status() {
    let h = harness();
    let (status, body) = call(&h.router, get("/api/v1/apps")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({}));

    let (status, body) = call(&h.router, get("/api/v1/apps/alice-foo")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn refresh_then_read_cached_status() {
    let h = harness();
    let id = DeploymentId::parse("alice-foo").unwrap();
    h.manager
        .create_app(&CreateOptions::new(id, "app:1", false, "bronze"))
        .await
        .unwrap();
    h.cluster.set_available_replicas("apps", "alice-foo", 1);

    let (status, body) = call(&h.router, post("/api/v1/apps/refresh", json!(null))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["alice-foo"]["tasks_running"], 1);

    let (status, body) = call(&h.router, get("/api/v1/apps/alice-foo")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["props"]["plan"], "bronze");
}

#[tokio::test]
async fn transaction_is_accepted_and_replied() {
    let h = harness();
    let (status, body) = call(
        &h.router,
        post(
            "/api/v1/cas/alice_ca1/transactions",
            json!({
                "reply_method": "deployed",
                "actions": [
                    {"op": "create_app", "app_local_name": "foo", "image": "app:1", "plan": "bronze"}
                ]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let request_id = body["data"]["request_ids"][0].as_str().unwrap().to_string();

    let mut replies = Vec::new();
    for _ in 0..100 {
        let (_, body) = call(&h.router, get("/api/v1/cas/alice_ca1/replies")).await;
        replies.extend(body["data"].as_array().unwrap().iter().cloned());
        if !replies.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["request_id"], request_id);
    assert_eq!(replies[0]["method"], "deployed");
    assert_eq!(replies[0]["error"], Value::Null);
    assert_eq!(replies[0]["data"]["id"], "alice-foo");

    assert_eq!(h.cluster.names("apps", ResourceKind::Deployment), vec!["alice-foo"]);

    // The checkpoint is cleared right after the commit finishes.
    for _ in 0..100 {
        if h.store.list().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.store.list().unwrap().is_empty());

    // The CA's queue is forgotten once nothing holds it.
    for _ in 0..100 {
        if h.state.queues.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.state.queues.lock().await.is_empty());
}

#[tokio::test]
async fn invalid_action_rejects_whole_batch() {
    let h = harness();
    let (status, body) = call(
        &h.router,
        post(
            "/api/v1/cas/alice_ca1/transactions",
            json!({
                "actions": [
                    {"op": "restart_app", "app_local_name": "foo"},
                    {"op": "restart_app", "app_local_name": "Not Valid"}
                ]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(h.cluster.calls().is_empty());
    assert!(h.store.list().unwrap().is_empty());
    assert!(h.state.queues.lock().await.is_empty());
}

async fn create(h: &Harness, raw: &str) {
    let id = DeploymentId::parse(raw).unwrap();
    h.manager
        .create_app(&CreateOptions::new(id, "app:1", false, "bronze"))
        .await
        .unwrap();
}

#[tokio::test]
async fn batch_status_keeps_request_order() {
    let h = harness();
    create(&h, "alice-foo").await;
    create(&h, "alice-bar").await;
    h.manager.stat_all().await.unwrap();

    let (status, body) = call(&h.router, get("/api/v1/apps?ids=alice-foo,bob-none,%20alice-bar")).await;
    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[0]["id"], "alice-foo");
    assert_eq!(data[1], Value::Null);
    assert_eq!(data[2]["id"], "alice-bar");

    let (_, body) = call(&h.router, get("/api/v1/apps?ids=")).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn ca_apps_are_keyed_by_local_name() {
    let h = harness();
    create(&h, "alice-foo").await;
    create(&h, "alice-bar").await;
    create(&h, "bob-foo").await;
    h.manager.stat_all().await.unwrap();

    let (status, body) = call(&h.router, get("/api/v1/cas/alice_ca1/apps")).await;
    assert_eq!(status, StatusCode::OK);
    let apps = body["data"].as_object().unwrap();
    assert_eq!(apps.keys().collect::<Vec<_>>(), vec!["bar", "foo"]);
    assert_eq!(apps["foo"]["id"], "alice-foo");

    let (status, body) = call(&h.router, get("/api/v1/cas/nodash/apps")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn malformed_ca_id_is_rejected() {
    let h = harness();
    let (status, _) = call(
        &h.router,
        post("/api/v1/cas/nodash/transactions", json!({"actions": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
