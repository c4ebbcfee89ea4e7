//! CRUD handlers for stored definitions.
//!
//! Handlers are generic over [`Resource`] and instantiated per kind in the
//! router. Environments get thin wrappers that keep the pool manager's
//! pools in step with the store.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::{ApiResponse, Environment, KilnError, KilnResult};
use kiln_store::Resource;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ApiState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
}

fn respond<T: Serialize>(status: StatusCode, result: KilnResult<T>) -> Response {
    match result {
        Ok(data) => (status, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: KilnError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<()>::err(err.to_string()))).into_response()
}

fn body<R>(body: Result<Json<R>, JsonRejection>) -> KilnResult<R> {
    body.map(|Json(obj)| obj)
        .map_err(|rejection| KilnError::Validation(rejection.body_text()))
}

/// Replace namespace and name with the ones in the path.
fn at_path<R: Resource>(mut obj: R, namespace: String, name: String) -> R {
    let meta = obj.metadata_mut();
    meta.namespace = namespace;
    meta.name = name;
    obj
}

fn create_in<R: Resource>(state: &ApiState, obj: KilnResult<R>) -> KilnResult<R> {
    Ok(state.store().repository::<R>().create(obj?)?)
}

fn update_in<R: Resource>(state: &ApiState, obj: KilnResult<R>) -> KilnResult<R> {
    Ok(state.store().repository::<R>().update(obj?)?)
}

fn delete_in<R: Resource>(state: &ApiState, namespace: &str, name: &str) -> KilnResult<String> {
    if state.store().repository::<R>().delete(namespace, name)? {
        Ok("deleted".to_string())
    } else {
        Err(KilnError::NotFound(format!("{} {namespace}/{name}", R::KIND)))
    }
}

// ── Generic ────────────────────────────────────────────────────

/// GET /v2/{kind}
pub async fn list<R: Resource>(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let result = state
        .store()
        .repository::<R>()
        .list(query.namespace.as_deref())
        .map_err(KilnError::from);
    respond(StatusCode::OK, result)
}

/// GET /v2/{kind}/{namespace}/{name}
pub async fn get_one<R: Resource>(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let result = state
        .store()
        .repository::<R>()
        .require(&namespace, &name)
        .map_err(KilnError::from);
    respond(StatusCode::OK, result)
}

/// POST /v2/{kind}
pub async fn create<R: Resource>(
    State(state): State<ApiState>,
    obj: Result<Json<R>, JsonRejection>,
) -> Response {
    respond(StatusCode::CREATED, create_in(&state, body(obj)))
}

/// PUT /v2/{kind}/{namespace}/{name}
pub async fn update<R: Resource>(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    obj: Result<Json<R>, JsonRejection>,
) -> Response {
    let obj = body(obj).map(|o| at_path(o, namespace, name));
    respond(StatusCode::OK, update_in(&state, obj))
}

/// DELETE /v2/{kind}/{namespace}/{name}
pub async fn delete<R: Resource>(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    respond(StatusCode::OK, delete_in::<R>(&state, &namespace, &name))
}

// ── Environments ───────────────────────────────────────────────

/// POST /v2/environments
pub async fn create_environment(
    State(state): State<ApiState>,
    obj: Result<Json<Environment>, JsonRejection>,
) -> Response {
    let result = create_in(&state, body(obj)).inspect(|env| {
        state.manager.pool_for(env);
    });
    respond(StatusCode::CREATED, result)
}

/// PUT /v2/environments/{namespace}/{name}
pub async fn update_environment(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    obj: Result<Json<Environment>, JsonRejection>,
) -> Response {
    let obj = body(obj).map(|o| at_path(o, namespace, name));
    let result = update_in(&state, obj).inspect(|env| {
        state.manager.pool_for(env);
    });
    respond(StatusCode::OK, result)
}

/// DELETE /v2/environments/{namespace}/{name}
pub async fn delete_environment(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let result = delete_in::<Environment>(&state, &namespace, &name);
    if result.is_ok() && state.manager.remove_pool(&namespace, &name).await {
        info!(%namespace, %name, "environment deleted; pool shut down");
    }
    respond(StatusCode::OK, result)
}
