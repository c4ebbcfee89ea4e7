//! Lookup and tap endpoints used by the executor client.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::{ApiResponse, FunctionIdentity, KilnError};
use tracing::{debug, warn};

use crate::ApiState;

/// POST /v2/getServiceForFunction
pub async fn get_service_for_function(
    State(state): State<ApiState>,
    body: Result<Json<FunctionIdentity>, JsonRejection>,
) -> Response {
    let mut identity = match body {
        Ok(Json(identity)) => identity,
        Err(rejection) => return plain_error(KilnError::Validation(rejection.body_text())),
    };
    if identity.name.is_empty() {
        return plain_error(KilnError::Validation("function name is required".into()));
    }
    if identity.namespace.is_empty() {
        identity.namespace = "default".to_string();
    }

    match state.manager.get_service_for_function(&identity).await {
        Ok(address) => (StatusCode::OK, address).into_response(),
        Err(e) => {
            warn!(%identity, error = %e, "lookup failed");
            plain_error(e)
        }
    }
}

/// POST /v2/tapService
///
/// Accepts a JSON array of addresses or one address per line. Unknown
/// addresses are ignored.
pub async fn tap_service(State(state): State<ApiState>, body: String) -> Response {
    let addresses = match parse_addresses(&body) {
        Ok(addresses) => addresses,
        Err(e) => return plain_error(e),
    };
    let hits = state.manager.tap(&addresses);
    debug!(received = addresses.len(), hits, "tap batch");
    StatusCode::OK.into_response()
}

/// GET /v2/pools
pub async fn pool_stats(State(state): State<ApiState>) -> Response {
    Json(ApiResponse::ok(state.manager.pool_stats())).into_response()
}

fn parse_addresses(body: &str) -> Result<Vec<String>, KilnError> {
    let trimmed = body.trim();
    if trimmed.starts_with('[') {
        let addresses: Vec<String> = serde_json::from_str(trimmed)
            .map_err(|e| KilnError::Validation(format!("tap body: {e}")))?;
        return Ok(addresses);
    }
    Ok(trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn plain_error(err: KilnError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_body_forms() {
        assert_eq!(
            parse_addresses(r#"["a:1", "b:2"]"#).unwrap(),
            vec!["a:1", "b:2"]
        );
        assert_eq!(parse_addresses("a:1\n\n b:2 \n").unwrap(), vec!["a:1", "b:2"]);
        assert_eq!(parse_addresses("a:1").unwrap(), vec!["a:1"]);
        assert!(parse_addresses("").unwrap().is_empty());
    }

    #[test]
    fn malformed_json_tap_body_is_rejected() {
        let err = parse_addresses("[\"a:1\",").unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
    }
}
