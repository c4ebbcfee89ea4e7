//! End-to-end: executor client → pool manager API → pool manager →
//! fetcher → runtime, all on loopback.
//!
//! One loopback server plays the fetcher sidecar and the runtime for
//! every container, the way standalone mode runs them on one host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use kiln_cache::FunctionServiceCache;
use kiln_client::ExecutorClient;
use kiln_core::config::{ClientConfig, PoolManagerConfig};
use kiln_core::{
    ApiResponse, FetchRequest, Function, FunctionIdentity, FunctionLoadRequest, FunctionRef,
    HttpClient,
};
use kiln_fetcher::{Fetcher, RemoteFunctionSource};
use kiln_poolmgr::{LocalOrchestrator, PoolManager, ServiceContext};
use kiln_store::MetadataStore;
use serde_json::json;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn load(Json(req): Json<FunctionLoadRequest>) -> StatusCode {
    if Path::new(&req.filepath).exists() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn serve(router: Router) -> (String, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), addr.port())
}

struct Daemon {
    api_url: String,
    manager: Arc<PoolManager>,
    shared: TempDir,
    runtime_port: u16,
}

async fn start_daemon() -> Daemon {
    let store = MetadataStore::open_in_memory().unwrap();
    let shared = tempfile::tempdir().unwrap();

    let fetcher = Fetcher::new(shared.path(), Arc::new(store.clone()), HttpClient::new(), TIMEOUT);
    let containers = kiln_fetcher::router(Arc::new(fetcher))
        .route("/specialize", post(load));
    let (_, runtime_port) = serve(containers).await;

    let config = PoolManagerConfig {
        pool_size: 1,
        fetcher_port: runtime_port,
        shared_mount_path: shared.path().to_string_lossy().into_owned(),
        call_timeout: TIMEOUT,
        ..PoolManagerConfig::default()
    };
    let ctx = ServiceContext::new(Arc::new(LocalOrchestrator::new("127.0.0.1")), store, config);
    let manager = PoolManager::start(ctx, FunctionServiceCache::new())
        .await
        .unwrap();
    let (api_url, _) = serve(kiln_api::build_router(Arc::clone(&manager))).await;

    Daemon {
        api_url,
        manager,
        shared,
        runtime_port,
    }
}

async fn post_definition(http: &HttpClient, url: &str, body: serde_json::Value) {
    let resp = http.post_json(url, &body, TIMEOUT).await.unwrap();
    assert!(resp.is_success(), "{}: {}", resp.status, resp.text());
}

fn function_body(code_b64: &str) -> serde_json::Value {
    json!({
        "metadata": { "name": "hello", "namespace": "default" },
        "spec": {
            "environmentName": "python",
            "deployment": { "literal": code_b64 }
        }
    })
}

async fn deploy(daemon: &Daemon, http: &HttpClient) {
    post_definition(
        http,
        &format!("{}/v2/environments", daemon.api_url),
        json!({
            "metadata": { "name": "python", "namespace": "default" },
            "spec": {
                "runtime": {
                    "image": "kiln/python-env",
                    "loadEndpointPort": daemon.runtime_port,
                    "loadEndpointPath": "/specialize"
                }
            }
        }),
    )
    .await;
    // "print('v1')"
    post_definition(
        http,
        &format!("{}/v2/functions", daemon.api_url),
        function_body("cHJpbnQoJ3YxJyk="),
    )
    .await;
}

#[tokio::test]
async fn lookup_tap_and_redeploy() {
    let daemon = start_daemon().await;
    let http = HttpClient::new();
    deploy(&daemon, &http).await;

    let client = ExecutorClient::new(
        &daemon.api_url,
        &ClientConfig {
            tap_interval: Duration::from_secs(3600),
            ..ClientConfig::default()
        },
    )
    .unwrap();
    let name_only = FunctionIdentity::new("default", "hello", "");

    let store = &daemon.manager.context().store;
    let delivered = || {
        let current: Function = store.functions().require("default", "hello").unwrap();
        std::fs::read(daemon.shared.path().join(current.identity().code_filename())).unwrap()
    };

    let first = client.get_service_for_function(&name_only).await.unwrap();
    let again = client.get_service_for_function(&name_only).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(delivered(), b"print('v1')");

    // Taps reach the cache once flushed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.tap_service(&first));
    client.shutdown().await;
    let entry = daemon
        .manager
        .cache()
        .entries()
        .into_iter()
        .find(|e| e.address == first)
        .unwrap();
    assert!(entry.idle_for < Duration::from_millis(150));

    // A redeploy is a new content version and a new instance.
    let mut updated: Function = store.functions().require("default", "hello").unwrap();
    updated.spec.deployment.literal = Some(b"print('v2')".to_vec());
    store.functions().update(updated).unwrap();

    let client = ExecutorClient::new(&daemon.api_url, &ClientConfig::default()).unwrap();
    let second = client.get_service_for_function(&name_only).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(delivered(), b"print('v2')");
}

#[tokio::test]
async fn lookup_errors_surface_status_and_message() {
    let daemon = start_daemon().await;
    let client = ExecutorClient::new(&daemon.api_url, &ClientConfig::default()).unwrap();

    let err = client
        .get_service_for_function(&FunctionIdentity::new("default", "missing", ""))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(err.to_string().contains("default/missing"), "{err}");
}

#[tokio::test]
async fn sidecar_fetcher_reads_definitions_from_the_api() {
    let daemon = start_daemon().await;
    let http = HttpClient::new();
    deploy(&daemon, &http).await;

    // The definitions API answers in the shared envelope.
    let resp = http
        .get(&format!("{}/v2/functions/default/hello", daemon.api_url), TIMEOUT)
        .await
        .unwrap();
    let envelope: ApiResponse<Function> = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(envelope.into_result(200).unwrap().metadata.name, "hello");

    let sidecar_volume = tempfile::tempdir().unwrap();
    let sidecar = Fetcher::new(
        sidecar_volume.path(),
        Arc::new(RemoteFunctionSource::new(&daemon.api_url, http.clone(), TIMEOUT)),
        http,
        TIMEOUT,
    );
    let path = sidecar
        .load(&FetchRequest::deployment(
            FunctionRef {
                name: "hello".into(),
                namespace: "default".into(),
            },
            "user-code",
        ))
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"print('v1')");
}
