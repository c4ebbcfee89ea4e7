//! kiln-api — HTTP surface of the pool manager.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v2/getServiceForFunction` | JSON identity → plain-text address |
//! | POST | `/v2/tapService` | JSON array or newline-separated addresses |
//! | GET | `/v2/functions` | List functions (`?namespace=`) |
//! | POST | `/v2/functions` | Create a function |
//! | GET | `/v2/functions/{namespace}/{name}` | Get a function |
//! | PUT | `/v2/functions/{namespace}/{name}` | Replace a function (new content version) |
//! | DELETE | `/v2/functions/{namespace}/{name}` | Delete a function |
//! | GET/POST | `/v2/environments` | List / create environments |
//! | GET/PUT/DELETE | `/v2/environments/{namespace}/{name}` | One environment |
//! | GET/POST | `/v2/triggers/http` | List / create HTTP triggers |
//! | GET/PUT/DELETE | `/v2/triggers/http/{namespace}/{name}` | One HTTP trigger |
//! | GET | `/v2/pools` | Per-environment pool counts |
//! | GET | `/healthz` | Liveness |
//!
//! The executor endpoints answer in plain text so the client can keep a
//! failure's status and message verbatim. Definition endpoints use the
//! `{success, data, error}` JSON envelope.

pub mod definitions;
pub mod executor;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use kiln_core::{Environment, Function, HttpTrigger};
use kiln_poolmgr::PoolManager;
use kiln_store::MetadataStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<PoolManager>,
}

impl ApiState {
    pub fn store(&self) -> &MetadataStore {
        &self.manager.context().store
    }
}

/// Build the complete pool manager router.
pub fn build_router(manager: Arc<PoolManager>) -> Router {
    let state = ApiState { manager };

    let v2 = Router::new()
        .route("/getServiceForFunction", post(executor::get_service_for_function))
        .route("/tapService", post(executor::tap_service))
        .route("/pools", get(executor::pool_stats))
        .route(
            "/functions",
            get(definitions::list::<Function>).post(definitions::create::<Function>),
        )
        .route(
            "/functions/{namespace}/{name}",
            get(definitions::get_one::<Function>)
                .put(definitions::update::<Function>)
                .delete(definitions::delete::<Function>),
        )
        .route(
            "/environments",
            get(definitions::list::<Environment>).post(definitions::create_environment),
        )
        .route(
            "/environments/{namespace}/{name}",
            get(definitions::get_one::<Environment>)
                .put(definitions::update_environment)
                .delete(definitions::delete_environment),
        )
        .route(
            "/triggers/http",
            get(definitions::list::<HttpTrigger>).post(definitions::create::<HttpTrigger>),
        )
        .route(
            "/triggers/http/{namespace}/{name}",
            get(definitions::get_one::<HttpTrigger>)
                .put(definitions::update::<HttpTrigger>)
                .delete(definitions::delete::<HttpTrigger>),
        )
        .with_state(state);

    Router::new()
        .nest("/v2", v2)
        .route("/healthz", get(|| async { "ok" }))
}
