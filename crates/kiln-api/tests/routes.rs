//! Pool manager API exercised through `Router::oneshot`.
//!
//! The manager runs against a `LocalOrchestrator` with an empty warm pool
//! target, so nothing here needs a live runtime container.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use kiln_cache::{FunctionServiceCache, Lookup};
use kiln_core::config::PoolManagerConfig;
use kiln_core::FunctionIdentity;
use kiln_poolmgr::{LocalOrchestrator, PoolManager, ServiceContext};
use kiln_store::MetadataStore;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn setup() -> (Router, Arc<PoolManager>) {
    let store = MetadataStore::open_in_memory().unwrap();
    let config = PoolManagerConfig {
        pool_size: 0,
        sweep_interval: Duration::from_secs(3600),
        replenish_interval: Duration::from_secs(3600),
        ..PoolManagerConfig::default()
    };
    let ctx = ServiceContext::new(Arc::new(LocalOrchestrator::new("127.0.0.1")), store, config);
    let manager = PoolManager::start(ctx, FunctionServiceCache::new())
        .await
        .unwrap();
    (kiln_api::build_router(Arc::clone(&manager)), manager)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn send_text(router: &Router, uri: &str, body: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn function_json(name: &str, code: &str) -> Value {
    json!({
        "metadata": { "name": name, "namespace": "default" },
        "spec": {
            "environmentName": "python",
            "deployment": { "literal": code }
        }
    })
}

fn environment_json(name: &str) -> Value {
    json!({
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "runtime": { "image": "kiln/python-env" } }
    })
}

/// Put an entry into the cache as if a specialization had finished.
fn seed_cache(manager: &PoolManager, identity: &FunctionIdentity, address: &str) {
    match manager.cache().get_or_reserve(identity) {
        Lookup::Reserved(token) => manager.cache().commit(token, address, "local-000042"),
        other => panic!("expected a reservation, got {other:?}"),
    }
}

#[tokio::test]
async fn healthz() {
    let (router, _) = setup().await;
    let (status, body) = send(&router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

// ── Definitions ────────────────────────────────────────────────

#[tokio::test]
async fn function_lifecycle() {
    let (router, _) = setup().await;

    let (status, created) =
        send_json(&router, "POST", "/v2/functions", Some(function_json("hello", "djE="))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["metadata"]["resourceVersion"], "1");
    let uid = created["data"]["metadata"]["uid"].as_str().unwrap().to_string();
    assert!(!uid.is_empty());

    let (status, fetched) = send_json(&router, "GET", "/v2/functions/default/hello", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["data"]["spec"]["deployment"]["literal"], "djE=");

    let (status, updated) = send_json(
        &router,
        "PUT",
        "/v2/functions/default/hello",
        Some(function_json("hello", "djI=")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["metadata"]["resourceVersion"], "2");
    assert_eq!(updated["data"]["metadata"]["uid"], uid.as_str());

    let (_, listed) = send_json(&router, "GET", "/v2/functions?namespace=default", None).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
    let (_, other_ns) = send_json(&router, "GET", "/v2/functions?namespace=staging", None).await;
    assert!(other_ns["data"].as_array().unwrap().is_empty());

    let (status, _) = send_json(&router, "DELETE", "/v2/functions/default/hello", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, missing) = send_json(&router, "GET", "/v2/functions/default/hello", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["success"], false);
    assert!(missing["error"].as_str().unwrap().contains("default/hello"));
}

#[tokio::test]
async fn duplicate_create_conflicts() {
    let (router, _) = setup().await;
    let body = function_json("hello", "djE=");
    send_json(&router, "POST", "/v2/functions", Some(body.clone())).await;

    let (status, resp) = send_json(&router, "POST", "/v2/functions", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(resp["success"], false);
}

#[tokio::test]
async fn invalid_definitions_are_rejected() {
    let (router, _) = setup().await;

    let no_package = json!({
        "metadata": { "name": "hello", "namespace": "default" },
        "spec": { "environmentName": "python" }
    });
    let (status, _) = send_json(&router, "POST", "/v2/functions", Some(no_package)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, resp) =
        send_json(&router, "POST", "/v2/functions", Some(json!({"metadata": 7}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["success"], false);

    let (status, _) =
        send_json(&router, "PUT", "/v2/functions/default/nope", Some(function_json("nope", "eA=="))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn environment_create_and_delete_manage_its_pool() {
    let (router, manager) = setup().await;

    let (status, _) =
        send_json(&router, "POST", "/v2/environments", Some(environment_json("python"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, pools) = send_json(&router, "GET", "/v2/pools", None).await;
    assert_eq!(pools["data"]["default/python"]["idle"], 0);

    let (status, _) = send_json(&router, "DELETE", "/v2/environments/default/python", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(manager.pool_stats().is_empty());

    let (status, _) = send_json(&router, "DELETE", "/v2/environments/default/python", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_triggers_are_stored() {
    let (router, _) = setup().await;
    let trigger = json!({
        "metadata": { "name": "hello-get", "namespace": "default" },
        "spec": {
            "relativeUrl": "/hello",
            "method": "GET",
            "functionRef": { "type": "name", "name": "hello" }
        }
    });
    let (status, _) = send_json(&router, "POST", "/v2/triggers/http", Some(trigger)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, listed) = send_json(&router, "GET", "/v2/triggers/http", None).await;
    assert_eq!(listed["data"][0]["spec"]["functionRef"]["name"], "hello");
}

// ── Executor endpoints ─────────────────────────────────────────

#[tokio::test]
async fn lookup_of_unknown_function_is_plain_text_404() {
    let (router, _) = setup().await;
    let (status, body) = send(
        &router,
        "POST",
        "/v2/getServiceForFunction",
        Some(json!({ "name": "nope", "namespace": "default" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(String::from_utf8(body).unwrap().starts_with("not found"));
}

#[tokio::test]
async fn lookup_without_name_is_bad_request() {
    let (router, _) = setup().await;
    let (status, _) = send(
        &router,
        "POST",
        "/v2/getServiceForFunction",
        Some(json!({ "name": "", "namespace": "default" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_text(&router, "/v2/getServiceForFunction", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cached_identity_resolves_to_its_address() {
    let (router, manager) = setup().await;
    let identity = FunctionIdentity::new("default", "hello", "u1_1");
    seed_cache(&manager, &identity, "hello-1.kiln-function:8888");

    let (status, body) = send(
        &router,
        "POST",
        "/v2/getServiceForFunction",
        Some(serde_json::to_value(&identity).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello-1.kiln-function:8888");
}

#[tokio::test]
async fn taps_refresh_cached_entries() {
    let (router, manager) = setup().await;
    seed_cache(
        &manager,
        &FunctionIdentity::new("default", "a", "u1_1"),
        "a.kiln-function:8888",
    );
    seed_cache(
        &manager,
        &FunctionIdentity::new("default", "b", "u2_1"),
        "b.kiln-function:8888",
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, body) = send_text(
        &router,
        "/v2/tapService",
        r#"["a.kiln-function:8888", "gone.kiln-function:8888"]"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (status, _) = send_text(&router, "/v2/tapService", "b.kiln-function:8888\n").await;
    assert_eq!(status, StatusCode::OK);

    for entry in manager.cache().entries() {
        assert!(entry.idle_for < Duration::from_millis(150), "{entry:?}");
    }
}

#[tokio::test]
async fn malformed_tap_batch_is_rejected() {
    let (router, _) = setup().await;
    let (status, _) = send_text(&router, "/v2/tapService", "[1, 2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
