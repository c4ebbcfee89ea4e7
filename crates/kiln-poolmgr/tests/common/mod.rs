//! Test harness: an in-memory store, a LocalOrchestrator, and one loopback
//! server playing every container's fetcher and runtime.
//!
//! The fetcher half is the real `kiln-fetcher` router writing into a temp
//! directory; the runtime half accepts load requests and checks that the
//! delivered file exists.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use kiln_cache::FunctionServiceCache;
use kiln_core::config::{ExhaustionPolicy, PoolManagerConfig};
use kiln_core::{
    Environment, EnvironmentSpec, Function, FunctionIdentity, FunctionLoadRequest, FunctionSpec,
    HttpClient, Metadata, Package, Runtime,
};
use kiln_fetcher::Fetcher;
use kiln_poolmgr::{LocalOrchestrator, PoolManager, ServiceContext};
use kiln_store::MetadataStore;
use tempfile::TempDir;

pub const ENV: &str = "python";
pub const PACKAGE_BODY: &[u8] = b"def main():\n    return 'hello'\n";

/// Knobs for the fake runtime.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    /// Load requests received.
    pub loads: Arc<AtomicUsize>,
    /// Answer this many load requests with 500 before succeeding.
    pub fail_first: Arc<AtomicUsize>,
    /// Delay before answering a load request.
    pub delay: Duration,
}

async fn load(
    State(rt): State<FakeRuntime>,
    Json(req): Json<FunctionLoadRequest>,
) -> (StatusCode, String) {
    rt.loads.fetch_add(1, Ordering::SeqCst);
    if !rt.delay.is_zero() {
        tokio::time::sleep(rt.delay).await;
    }
    let should_fail = rt
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if should_fail {
        return (StatusCode::INTERNAL_SERVER_ERROR, "runtime crashed".into());
    }
    if Path::new(&req.filepath).exists() {
        (StatusCode::OK, String::new())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{} missing", req.filepath),
        )
    }
}

pub struct Harness {
    pub store: MetadataStore,
    pub orchestrator: Arc<LocalOrchestrator>,
    pub manager: Arc<PoolManager>,
    pub runtime: FakeRuntime,
    pub shared: TempDir,
    /// Base URL of the loopback container server (also serves `/pkg`).
    pub base_url: String,
}

pub struct Options {
    pub config: PoolManagerConfig,
    pub runtime: FakeRuntime,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: PoolManagerConfig {
                pool_size: 0,
                max_pool_size: 4,
                exhaustion: ExhaustionPolicy::Fail,
                max_attempts: 3,
                call_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(120),
                sweep_interval: Duration::from_secs(3600),
                specializing_stale_after: Duration::from_secs(120),
                replenish_interval: Duration::from_secs(3600),
                ..PoolManagerConfig::default()
            },
            runtime: FakeRuntime::default(),
        }
    }
}

impl Harness {
    pub async fn start(opts: Options) -> Self {
        Self::start_with(opts, Arc::new(LocalOrchestrator::new("127.0.0.1")), None).await
    }

    pub async fn start_with(
        opts: Options,
        orchestrator: Arc<LocalOrchestrator>,
        instance_id: Option<&str>,
    ) -> Self {
        let store = MetadataStore::open_in_memory().unwrap();
        let shared = tempfile::tempdir().unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fetcher = Fetcher::new(
            shared.path(),
            Arc::new(store.clone()),
            HttpClient::new(),
            Duration::from_secs(5),
        );
        let runtime = opts.runtime.clone();
        let app = kiln_fetcher::router(Arc::new(fetcher))
            .merge(
                Router::new()
                    .route("/specialize", post(load))
                    .with_state(runtime.clone()),
            )
            .route("/pkg", get(|| async { PACKAGE_BODY }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        store.environments().create(environment(port)).unwrap();

        let config = PoolManagerConfig {
            shared_mount_path: shared.path().to_string_lossy().into_owned(),
            fetcher_port: port,
            ..opts.config
        };
        let mut ctx = ServiceContext::new(orchestrator.clone(), store.clone(), config);
        if let Some(id) = instance_id {
            ctx = ctx.with_instance_id(id);
        }
        let manager = PoolManager::start(ctx, FunctionServiceCache::new())
            .await
            .unwrap();

        Self {
            store,
            orchestrator,
            manager,
            runtime,
            shared,
            base_url: format!("http://127.0.0.1:{port}"),
        }
    }

    pub fn port(&self) -> u16 {
        self.manager.context().config.fetcher_port
    }

    /// Store a function with an inline package.
    pub fn create_function(&self, name: &str, code: &[u8]) -> Function {
        self.store
            .functions()
            .create(function(name, Package::literal(code.to_vec())))
            .unwrap()
    }

    pub fn update_function(&self, name: &str, code: &[u8]) -> Function {
        self.store
            .functions()
            .update(function(name, Package::literal(code.to_vec())))
            .unwrap()
    }

    pub async fn resolve(&self, name: &str) -> kiln_core::KilnResult<String> {
        self.manager
            .get_service_for_function(&FunctionIdentity::new("default", name, ""))
            .await
    }

    pub fn loads(&self) -> usize {
        self.runtime.loads.load(Ordering::SeqCst)
    }
}

pub fn environment(port: u16) -> Environment {
    Environment {
        metadata: Metadata::new("default", ENV),
        spec: EnvironmentSpec {
            version: 1,
            runtime: Runtime {
                image: "kiln/python-env".into(),
                load_endpoint_port: port,
                load_endpoint_path: "/specialize".into(),
                function_endpoint_port: 8888,
            },
            builder: None,
            documentation_url: None,
            pool_size: None,
        },
    }
}

pub fn function(name: &str, deployment: Package) -> Function {
    Function {
        metadata: Metadata::new("default", name),
        spec: FunctionSpec {
            environment_name: ENV.into(),
            source: Package::default(),
            deployment,
        },
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
