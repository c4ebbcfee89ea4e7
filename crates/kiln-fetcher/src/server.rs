//! HTTP surface of the fetcher sidecar.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/` | Execute a fetch request; 200 with an empty body on success |
//! | GET | `/healthz` | Liveness |

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use kiln_core::{FetchRequest, KilnError};

use crate::fetcher::Fetcher;

pub fn router(fetcher: Arc<Fetcher>) -> Router {
    Router::new()
        .route("/", post(fetch))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(fetcher)
}

/// POST /
async fn fetch(
    State(fetcher): State<Arc<Fetcher>>,
    body: Result<Json<FetchRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(req) => req,
        Err(rejection) => {
            return error_response(KilnError::Validation(rejection.body_text()));
        }
    };
    match fetcher.load(&req).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: KilnError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}
