//! Outbound HTTP client.
//!
//! A small wrapper around hyper's pooled client. Every request carries
//! an explicit timeout and the whole response body is collected before
//! returning, which suits the short control-plane calls Kiln makes
//! (fetch, specialize, lookup, tap) and package downloads.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::debug;

use crate::error::KilnError;

/// Errors from a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid request to {url}: {reason}")]
    Request { url: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("reading response from {url} failed: {reason}")]
    Body { url: String, reason: String },
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout { .. })
    }
}

/// Transport failures surface as gateway errors; a malformed request is
/// our own fault.
impl From<HttpError> for KilnError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Request { .. } => KilnError::Internal(err.to_string()),
            HttpError::Timeout { .. } => KilnError::Upstream {
                status: 504,
                message: err.to_string(),
            },
            HttpError::Transport { .. } | HttpError::Body { .. } => KilnError::Upstream {
                status: 502,
                message: err.to_string(),
            },
        }
    }
}

/// A fully collected HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared, cloneable HTTP client with connection pooling.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpConnector, Full<Bytes>>,
    user_agent: String,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_user_agent("kiln/0.1")
    }

    pub fn with_user_agent(user_agent: &str) -> Self {
        let inner = Client::builder(TokioExecutor::new()).build_http();
        Self {
            inner,
            user_agent: user_agent.to_string(),
        }
    }

    /// `GET url`.
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, HttpError> {
        self.send(Method::GET, url, None, Bytes::new(), timeout)
            .await
    }

    /// `POST url` with the given body and content type.
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        self.send(Method::POST, url, Some(content_type), body.into(), timeout)
            .await
    }

    /// `POST url` with a JSON-encoded body.
    pub async fn post_json<T: serde::Serialize>(
        &self,
        url: &str,
        value: &T,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let body = serde_json::to_vec(value).map_err(|e| HttpError::Request {
            url: url.to_string(),
            reason: format!("encode body: {e}"),
        })?;
        self.post(url, "application/json", body, timeout).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        content_type: Option<&str>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(url)
            .header("user-agent", &self.user_agent);
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        let req = builder
            .body(Full::new(body))
            .map_err(|e| HttpError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let exchange = async {
            let resp = self
                .inner
                .request(req)
                .await
                .map_err(|e| HttpError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| HttpError::Body {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?
                .to_bytes();
            Ok::<_, HttpError>(HttpResponse {
                status: parts.status,
                body,
            })
        };

        let resp = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| HttpError::Timeout {
                url: url.to_string(),
                timeout,
            })??;

        debug!(%method, %url, status = %resp.status, bytes = resp.body.len(), "http exchange");
        Ok(resp)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
